//! Construction of the script environment.
//!
//! User code runs with a private environment table instead of the Lua
//! globals. The table holds a small allow-list of builtins plus the entries
//! of the invocation's [`BindingTable`]. Lookups of known-dangerous names
//! record a [`Violation`] and raise [`SandboxInterrupt::CapabilityDenied`];
//! anything else missing is `nil`.

use std::time::Instant;

use mlua::{ChunkMode, Function, Lua, Table, Value as LuaValue};
use scriptflow_sandbox::Binding;
use scriptflow_sandbox::BindingTable;
use scriptflow_sandbox::bindings::LOG;

use crate::capabilities;
use crate::classify::{SandboxInterrupt, Violation, script_message, strip_traceback};
use crate::convert::Converter;
use crate::pattern;

/// Builtins copied from the globals into every script environment.
const SAFE_GLOBALS: &[&str] = &[
  "assert",
  "error",
  "getmetatable",
  "ipairs",
  "next",
  "pairs",
  "rawequal",
  "rawget",
  "rawlen",
  "select",
  "setmetatable",
  "tonumber",
  "tostring",
  "type",
  "_VERSION",
  "math",
  "string",
  "table",
  "utf8",
];

/// Names whose lookup is treated as an attempt to escape the sandbox.
pub(crate) const DENIED_GLOBALS: &[&str] = &[
  "collectgarbage",
  "debug",
  "dofile",
  "getfenv",
  "io",
  "load",
  "loadfile",
  "loadstring",
  "module",
  "newproxy",
  "os",
  "package",
  "process",
  "require",
  "setfenv",
];

/// Runs once per state with the real globals as its environment.
///
/// Receives the raw `pcall`/`xpcall`, the `expired()` and `violated()`
/// checks and the error cleaner. Returns the read-only proxy helpers plus
/// the `pcall`, `xpcall` and `rawset` handed to scripts.
const PRELUDE: &str = r#"
local raw_pcall, raw_xpcall, expired, violated, clean = ...
local error, next, rawset, setmetatable, tostring = error, next, rawset, setmetatable, tostring
local pack, unpack, concat = table.pack, table.unpack, table.concat

local backing_of = setmetatable({}, { __mode = "k" })

local function read_only()
  error("payload is read-only", 2)
end

local frozen = {
  __index = function(proxy, key) return backing_of[proxy][key] end,
  __newindex = read_only,
  __len = function(proxy) return #backing_of[proxy] end,
  __pairs = function(proxy)
    local backing = backing_of[proxy]
    return function(_, key) return next(backing, key) end, proxy, nil
  end,
  __metatable = "read-only",
}

local function freeze(t)
  local proxy = {}
  backing_of[proxy] = t
  return setmetatable(proxy, frozen)
end

local function unwrap(v)
  return backing_of[v]
end

local function guarded_rawset(t, key, value)
  if backing_of[t] ~= nil then
    error("payload is read-only", 2)
  end
  return rawset(t, key, value)
end

local function halted()
  return expired() or violated()
end

local function pcall(f, ...)
  local results = pack(raw_pcall(f, ...))
  if not results[1] then
    if halted() then
      error(results[2], 0)
    end
    results[2] = clean(results[2])
  end
  return unpack(results, 1, results.n)
end

local function xpcall(f, handler, ...)
  local results = pack(raw_xpcall(f, function(err)
    if halted() then
      return err
    end
    return handler(clean(err))
  end, ...))
  if not results[1] and halted() then
    error(results[2], 0)
  end
  return unpack(results, 1, results.n)
end

local function make_print(sink)
  return function(...)
    local parts = pack(...)
    for i = 1, parts.n do
      parts[i] = tostring(parts[i])
    end
    sink(concat(parts, "\t", 1, parts.n))
  end
end

return freeze, unwrap, pcall, xpcall, guarded_rawset, make_print
"#;

/// Values returned by [`PRELUDE`].
type PreludeExports = (Function, Function, Function, Function, Function, Function);

pub(crate) struct ScriptEnvironment {
  pub(crate) table: Table,
  pub(crate) converter: Converter,
  pub(crate) violation: Violation,
}

/// Build the environment for one script in `lua`.
pub(crate) fn build(
  lua: &Lua,
  bindings: &BindingTable,
  deadline: Instant,
) -> mlua::Result<ScriptEnvironment> {
  let globals = lua.globals();

  let violation = Violation::default();

  let string_lib: Table = globals.get("string")?;
  string_lib.raw_set("dump", LuaValue::Nil)?;
  pattern::install(lua, &string_lib, deadline)?;

  let raw_pcall: Function = globals.get("pcall")?;
  let raw_xpcall: Function = globals.get("xpcall")?;
  let expired = lua.create_function(move |_, ()| Ok(Instant::now() >= deadline))?;
  let violated = {
    let violation = violation.clone();
    lua.create_function(move |_, ()| Ok(violation.is_recorded()))?
  };
  let clean = lua.create_function(clean_error)?;

  let prelude = lua
    .load(PRELUDE)
    .set_name("=sandbox")
    .set_mode(ChunkMode::Text)
    .into_function()?;
  let (freeze, unwrap, pcall, xpcall, rawset, make_print): PreludeExports =
    prelude.call((raw_pcall, raw_xpcall, expired, violated, clean))?;
  let converter = Converter::new(freeze, unwrap);

  let env = lua.create_table()?;
  for name in SAFE_GLOBALS {
    let value: LuaValue = globals.raw_get(*name)?;
    env.raw_set(*name, value)?;
  }
  let table_lib: Table = globals.get("table")?;
  let unpack: LuaValue = table_lib.raw_get("unpack")?;
  env.raw_set("unpack", unpack)?;
  env.raw_set("pcall", pcall)?;
  env.raw_set("xpcall", xpcall)?;
  env.raw_set("rawset", rawset)?;
  env.raw_set("_G", env.clone())?;

  for (name, binding) in bindings.iter() {
    let value = capabilities::install(lua, binding, &converter, &violation)?;
    env.raw_set(name, value)?;
  }

  if let Some(Binding::Log(log)) = bindings.get(LOG) {
    let sink = capabilities::print_sink(lua, log.clone())?;
    let print: Function = make_print.call(sink)?;
    env.raw_set("print", print)?;
  }

  env.set_metatable(Some(guard_metatable(lua, violation.clone())?));

  Ok(ScriptEnvironment {
    table: env,
    converter,
    violation,
  })
}

/// Error value handed to a script's `pcall`/`xpcall` handler: host errors
/// become their message and tracebacks are dropped.
fn clean_error(lua: &Lua, err: LuaValue) -> mlua::Result<LuaValue> {
  match err {
    LuaValue::Error(e) => lua.create_string(script_message(&e)).map(LuaValue::String),
    LuaValue::String(text) => {
      let message = text.to_string_lossy().to_string();
      let stripped = strip_traceback(&message);
      if stripped.len() == message.len() {
        Ok(LuaValue::String(text))
      } else {
        lua.create_string(stripped).map(LuaValue::String)
      }
    }
    other => Ok(other),
  }
}

fn guard_metatable(lua: &Lua, violation: Violation) -> mlua::Result<Table> {
  let meta = lua.create_table()?;
  let index = lua.create_function(move |_, (_env, key): (LuaValue, LuaValue)| {
    if let LuaValue::String(name) = key {
      let name = name.to_string_lossy().to_string();
      if DENIED_GLOBALS.contains(&name.as_str()) {
        let interrupt = SandboxInterrupt::CapabilityDenied { name };
        violation.record(interrupt.to_string());
        return Err(mlua::Error::external(interrupt));
      }
    }
    Ok(LuaValue::Nil)
  })?;
  meta.raw_set("__index", index)?;
  meta.raw_set("__metatable", "locked")?;
  Ok(meta)
}
