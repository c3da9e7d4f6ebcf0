//! Lua-side shapes of the capability bindings.

use std::time::Duration;

use mlua::{Function, Lua, Table, Value as LuaValue};
use scriptflow_host_http::{HttpError, HttpResponse, HttpShim, RequestBody, RequestOptions};
use scriptflow_host_log::{LogLevel, ScriptLog};
use scriptflow_sandbox::Binding;

use crate::classify::{Violation, http_denied};
use crate::convert::Converter;

/// Turn one binding into the Lua value installed under its name.
pub(crate) fn install(
  lua: &Lua,
  binding: &Binding,
  converter: &Converter,
  violation: &Violation,
) -> mlua::Result<LuaValue> {
  match binding {
    Binding::ReadOnlyData(data) => converter.to_lua(lua, data, true),
    Binding::Secrets(secrets) => {
      let table = lua.create_table()?;
      for (name, value) in secrets.iter() {
        table.raw_set(name, value)?;
      }
      Ok(LuaValue::Table(table))
    }
    Binding::Log(log) => log_table(lua, log.clone(), converter.clone()).map(LuaValue::Table),
    Binding::Http(http) => {
      http_table(lua, http.clone(), converter.clone(), violation.clone()).map(LuaValue::Table)
    }
    Binding::Json => json_table(lua, converter.clone()).map(LuaValue::Table),
    Binding::Sleep => sleep_function(lua).map(LuaValue::Function),
  }
}

/// Receives the already formatted line from the prelude's `print`.
pub(crate) fn print_sink(lua: &Lua, log: ScriptLog) -> mlua::Result<Function> {
  lua.create_function(move |_, line: String| {
    log.info(&line);
    Ok(())
  })
}

fn log_table(lua: &Lua, log: ScriptLog, converter: Converter) -> mlua::Result<Table> {
  let table = lua.create_table()?;
  for level in [LogLevel::Info, LogLevel::Warn, LogLevel::Error] {
    let log = log.clone();
    let converter = converter.clone();
    let function = lua.create_function(move |_, message: LuaValue| {
      log.log(level, &display(&converter, &message));
      Ok(())
    })?;
    table.raw_set(level.to_string(), function)?;
  }
  Ok(table)
}

/// Text for a logged value: strings as-is, tables as JSON.
fn display(converter: &Converter, value: &LuaValue) -> String {
  match value {
    LuaValue::Nil => "nil".to_string(),
    LuaValue::Boolean(b) => b.to_string(),
    LuaValue::Integer(i) => i.to_string(),
    LuaValue::Number(n) => n.to_string(),
    LuaValue::String(s) => s.to_string_lossy().to_string(),
    LuaValue::Table(_) => match converter.to_json(value) {
      Ok(json) => json.to_string(),
      Err(_) => "table".to_string(),
    },
    other => other.type_name().to_string(),
  }
}

/// Refused requests are recorded before the error reaches the script.
fn http_error(violation: &Violation, err: HttpError) -> mlua::Error {
  if err.is_policy_violation() {
    violation.record(http_denied(&err));
  }
  mlua::Error::external(err)
}

fn http_table(
  lua: &Lua,
  http: HttpShim,
  converter: Converter,
  violation: Violation,
) -> mlua::Result<Table> {
  let table = lua.create_table()?;

  let get = {
    let http = http.clone();
    let converter = converter.clone();
    let violation = violation.clone();
    lua.create_async_function(move |lua, (url, options): (String, Option<Table>)| {
      let http = http.clone();
      let converter = converter.clone();
      let violation = violation.clone();
      let options = request_options(options);
      async move {
        let response = http
          .get(&url, options?)
          .await
          .map_err(|e| http_error(&violation, e))?;
        response_table(&lua, &converter, response)
      }
    })?
  };

  let post = lua.create_async_function(
    move |lua, (url, body, options): (String, LuaValue, Option<Table>)| {
      let http = http.clone();
      let converter = converter.clone();
      let violation = violation.clone();
      let body = request_body(&converter, &body);
      let options = request_options(options);
      async move {
        let response = http
          .post(&url, body?, options?)
          .await
          .map_err(|e| http_error(&violation, e))?;
        response_table(&lua, &converter, response)
      }
    },
  )?;

  table.raw_set("get", get)?;
  table.raw_set("post", post)?;
  Ok(table)
}

fn request_options(options: Option<Table>) -> mlua::Result<RequestOptions> {
  let mut parsed = RequestOptions::default();
  let Some(options) = options else {
    return Ok(parsed);
  };

  let timeout_ms: Option<u64> = options.get("timeout_ms")?;
  parsed.timeout = timeout_ms.map(Duration::from_millis);
  parsed.max_response_bytes = options.get("max_response_bytes")?;
  let raise_for_status: Option<bool> = options.get("raise_for_status")?;
  if let Some(raise) = raise_for_status {
    parsed.raise_for_status = raise;
  }

  let headers: Option<Table> = options.get("headers")?;
  if let Some(headers) = headers {
    headers.for_each(|name: String, value: String| {
      parsed.headers.push((name, value));
      Ok(())
    })?;
  }

  Ok(parsed)
}

fn request_body(converter: &Converter, body: &LuaValue) -> mlua::Result<RequestBody> {
  match body {
    LuaValue::Nil => Ok(RequestBody::Empty),
    LuaValue::String(text) => Ok(RequestBody::Text(text.to_string_lossy().to_string())),
    other => converter.to_json(other).map(RequestBody::Json),
  }
}

fn response_table(lua: &Lua, converter: &Converter, response: HttpResponse) -> mlua::Result<Table> {
  let table = lua.create_table()?;
  table.raw_set("status", response.status)?;
  table.raw_set("ok", response.is_success())?;

  let headers = lua.create_table()?;
  for (name, value) in &response.headers {
    headers.raw_set(name.as_str(), value.as_str())?;
  }
  table.raw_set("headers", headers)?;

  if let Some(json) = response.json() {
    table.raw_set("json", converter.to_lua(lua, &json, false)?)?;
  }
  table.raw_set("body", response.body)?;
  Ok(table)
}

fn json_table(lua: &Lua, converter: Converter) -> mlua::Result<Table> {
  let table = lua.create_table()?;

  let encode = {
    let converter = converter.clone();
    lua.create_function(move |_, value: LuaValue| {
      let json = converter.to_json(&value)?;
      serde_json::to_string(&json).map_err(mlua::Error::external)
    })?
  };

  let decode = lua.create_function(move |lua, text: String| {
    let json: serde_json::Value = serde_json::from_str(&text).map_err(mlua::Error::external)?;
    converter.to_lua(lua, &json, false)
  })?;

  table.raw_set("encode", encode)?;
  table.raw_set("decode", decode)?;
  Ok(table)
}

/// `sleep(ms)`: yields to the host; the invocation deadline still applies.
fn sleep_function(lua: &Lua) -> mlua::Result<Function> {
  lua.create_async_function(|_, ms: u64| async move {
    tokio::time::sleep(Duration::from_millis(ms)).await;
    Ok(())
  })
}
