//! JSON ↔ Lua value conversion.

use mlua::{Function, Lua, Table, Value as LuaValue};
use serde_json::{Map, Number, Value};

/// Nesting limit in both directions; also stops on cyclic tables.
const MAX_DEPTH: usize = 64;

/// Converts between `serde_json::Value` and Lua values for one Lua state.
///
/// Holds the `freeze`/`unwrap` pair from the environment prelude: `freeze`
/// wraps a table in a read-only proxy and `unwrap` returns the table behind
/// a proxy (or `nil`).
#[derive(Clone)]
pub(crate) struct Converter {
  freeze: Function,
  unwrap: Function,
}

impl Converter {
  pub(crate) fn new(freeze: Function, unwrap: Function) -> Self {
    Self { freeze, unwrap }
  }

  /// Convert JSON into a Lua value. With `frozen`, every table in the result
  /// is a read-only proxy.
  pub(crate) fn to_lua(&self, lua: &Lua, value: &Value, frozen: bool) -> mlua::Result<LuaValue> {
    self.to_lua_at(lua, value, frozen, 0)
  }

  fn to_lua_at(
    &self,
    lua: &Lua,
    value: &Value,
    frozen: bool,
    depth: usize,
  ) -> mlua::Result<LuaValue> {
    if depth > MAX_DEPTH {
      return Err(mlua::Error::runtime(format!(
        "value nesting exceeds {MAX_DEPTH} levels"
      )));
    }

    let converted = match value {
      Value::Null => LuaValue::Nil,
      Value::Bool(b) => LuaValue::Boolean(*b),
      Value::Number(n) => match n.as_i64() {
        Some(i) => LuaValue::Integer(i),
        None => LuaValue::Number(n.as_f64().unwrap_or(f64::NAN)),
      },
      Value::String(s) => LuaValue::String(lua.create_string(s)?),
      Value::Array(items) => {
        let table = lua.create_table()?;
        for (index, item) in items.iter().enumerate() {
          table.raw_set(index + 1, self.to_lua_at(lua, item, frozen, depth + 1)?)?;
        }
        self.finish(table, frozen)?
      }
      Value::Object(map) => {
        let table = lua.create_table()?;
        for (key, item) in map {
          table.raw_set(key.as_str(), self.to_lua_at(lua, item, frozen, depth + 1)?)?;
        }
        self.finish(table, frozen)?
      }
    };

    Ok(converted)
  }

  fn finish(&self, table: Table, frozen: bool) -> mlua::Result<LuaValue> {
    if frozen {
      self.freeze.call(table)
    } else {
      Ok(LuaValue::Table(table))
    }
  }

  /// Convert a Lua value into JSON.
  ///
  /// Tables whose keys are exactly `1..=n` become arrays; every other table,
  /// including the empty one, becomes an object. Read-only proxies convert
  /// as the table they wrap.
  pub(crate) fn to_json(&self, value: &LuaValue) -> mlua::Result<Value> {
    self.to_json_at(value, 0)
  }

  fn to_json_at(&self, value: &LuaValue, depth: usize) -> mlua::Result<Value> {
    match value {
      LuaValue::Nil => Ok(Value::Null),
      LuaValue::Boolean(b) => Ok(Value::Bool(*b)),
      LuaValue::Integer(i) => Ok(Value::Number((*i).into())),
      LuaValue::Number(n) => Number::from_f64(*n)
        .map(Value::Number)
        .ok_or_else(|| mlua::Error::runtime("cannot convert NaN or infinity to JSON")),
      LuaValue::String(s) => Ok(Value::String(s.to_string_lossy().to_string())),
      LuaValue::Table(table) => {
        if depth >= MAX_DEPTH {
          return Err(mlua::Error::runtime(format!(
            "value nesting exceeds {MAX_DEPTH} levels (cyclic table?)"
          )));
        }
        let backing: Option<Table> = self.unwrap.call(table.clone())?;
        self.table_to_json(backing.as_ref().unwrap_or(table), depth)
      }
      other => Err(mlua::Error::runtime(format!(
        "cannot convert a {} value to JSON",
        other.type_name()
      ))),
    }
  }

  fn table_to_json(&self, table: &Table, depth: usize) -> mlua::Result<Value> {
    let mut entries: Vec<(LuaValue, LuaValue)> = Vec::new();
    table.for_each(|key: LuaValue, value: LuaValue| {
      entries.push((key, value));
      Ok(())
    })?;

    if let Some(mut indexed) = sequence_entries(&entries) {
      indexed.sort_by_key(|(index, _)| *index);
      let items = indexed
        .into_iter()
        .map(|(_, value)| self.to_json_at(value, depth + 1))
        .collect::<mlua::Result<Vec<_>>>()?;
      return Ok(Value::Array(items));
    }

    let mut map = Map::new();
    for (key, value) in &entries {
      map.insert(object_key(key)?, self.to_json_at(value, depth + 1)?);
    }
    Ok(Value::Object(map))
  }
}

/// `Some` when the keys are exactly the integers `1..=entries.len()`.
fn sequence_entries(entries: &[(LuaValue, LuaValue)]) -> Option<Vec<(i64, &LuaValue)>> {
  if entries.is_empty() {
    return None;
  }
  let len = entries.len() as i64;
  entries
    .iter()
    .map(|(key, value)| match key {
      LuaValue::Integer(i) if (1..=len).contains(i) => Some((*i, value)),
      _ => None,
    })
    .collect()
}

fn object_key(key: &LuaValue) -> mlua::Result<String> {
  match key {
    LuaValue::String(s) => Ok(s.to_string_lossy().to_string()),
    LuaValue::Integer(i) => Ok(i.to_string()),
    LuaValue::Number(n) => Ok(n.to_string()),
    LuaValue::Boolean(b) => Ok(b.to_string()),
    other => Err(mlua::Error::runtime(format!(
      "cannot use a {} as a JSON object key",
      other.type_name()
    ))),
  }
}
