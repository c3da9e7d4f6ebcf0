//! Lua string patterns that respect the run deadline.
//!
//! The stock `string.find`, `string.match`, `string.gmatch` and
//! `string.gsub` match in C, where the instruction hook never fires, so a
//! backtracking pattern could keep a worker busy long after the deadline.
//! These replacements implement the same pattern language and check the
//! deadline while they backtrack.

use std::time::Instant;

use mlua::{Function, Lua, String as LuaString, Table, Value as LuaValue, Variadic};
use thiserror::Error;

use crate::classify::SandboxInterrupt;

const ESC: u8 = b'%';
const SPECIALS: &[u8] = b"^$*+?.([%-";
const MAX_CAPTURES: usize = 32;
const MAX_DEPTH: usize = 200;
/// Matcher steps between deadline checks.
const DEADLINE_CHECK_INTERVAL: u64 = 4096;

#[derive(Debug, Error)]
enum PatternError {
  #[error("{0}")]
  Malformed(String),
  #[error("deadline exceeded while matching")]
  Deadline,
}

impl PatternError {
  fn malformed(message: impl Into<String>) -> Self {
    PatternError::Malformed(message.into())
  }
}

impl From<PatternError> for mlua::Error {
  fn from(err: PatternError) -> Self {
    match err {
      PatternError::Malformed(message) => mlua::Error::runtime(message),
      PatternError::Deadline => mlua::Error::external(SandboxInterrupt::DeadlineExceeded),
    }
  }
}

type MatchResult = Result<Option<usize>, PatternError>;

#[derive(Debug, Clone, Copy)]
enum CaptureLen {
  Position,
  Open,
  Closed(usize),
}

#[derive(Debug, Clone, Copy)]
struct Capture {
  init: usize,
  len: CaptureLen,
}

struct Matcher<'a> {
  src: &'a [u8],
  pat: &'a [u8],
  captures: Vec<Capture>,
  depth: usize,
  steps: u64,
  deadline: Instant,
}

impl<'a> Matcher<'a> {
  fn new(src: &'a [u8], pat: &'a [u8], deadline: Instant) -> Self {
    Self {
      src,
      pat,
      captures: Vec::new(),
      depth: MAX_DEPTH,
      steps: 0,
      deadline,
    }
  }

  fn reset(&mut self) {
    self.captures.clear();
    self.depth = MAX_DEPTH;
  }

  fn tick(&mut self) -> Result<(), PatternError> {
    self.steps += 1;
    if self.steps % DEADLINE_CHECK_INTERVAL == 0 && Instant::now() >= self.deadline {
      return Err(PatternError::Deadline);
    }
    Ok(())
  }

  /// Match `pat[p..]` at `src[s..]`, returning the end of the match.
  fn matches(&mut self, s: usize, p: usize) -> MatchResult {
    if self.depth == 0 {
      return Err(PatternError::malformed("pattern too complex"));
    }
    self.depth -= 1;
    let result = self.match_here(s, p);
    self.depth += 1;
    result
  }

  fn match_here(&mut self, mut s: usize, mut p: usize) -> MatchResult {
    loop {
      self.tick()?;
      if p == self.pat.len() {
        return Ok(Some(s));
      }
      let next = self.pat.get(p + 1).copied();
      match self.pat[p] {
        b'(' if next == Some(b')') => return self.start_capture(s, p + 2, CaptureLen::Position),
        b'(' => return self.start_capture(s, p + 1, CaptureLen::Open),
        b')' => return self.end_capture(s, p + 1),
        b'$' if p + 1 == self.pat.len() => return Ok((s == self.src.len()).then_some(s)),
        ESC if next == Some(b'b') => match self.match_balance(s, p + 2)? {
          Some(end) => {
            s = end;
            p += 4;
          }
          None => return Ok(None),
        },
        ESC if next == Some(b'f') => {
          p += 2;
          if self.pat.get(p) != Some(&b'[') {
            return Err(PatternError::malformed("missing '[' after '%f' in pattern"));
          }
          let ep = self.class_end(p)?;
          let previous = if s == 0 { 0 } else { self.src[s - 1] };
          let current = self.src.get(s).copied().unwrap_or(0);
          if self.match_bracket_class(previous, p, ep - 1)
            || !self.match_bracket_class(current, p, ep - 1)
          {
            return Ok(None);
          }
          p = ep;
        }
        ESC if next.is_some_and(|c| c.is_ascii_digit()) => {
          match self.match_back_reference(s, self.pat[p + 1])? {
            Some(end) => {
              s = end;
              p += 2;
            }
            None => return Ok(None),
          }
        }
        _ => {
          let ep = self.class_end(p)?;
          let quantifier = self.pat.get(ep).copied();
          if !self.single_match(s, p, ep) {
            if matches!(quantifier, Some(b'*' | b'?' | b'-')) {
              p = ep + 1;
              continue;
            }
            return Ok(None);
          }
          match quantifier {
            Some(b'?') => {
              if let Some(end) = self.matches(s + 1, ep + 1)? {
                return Ok(Some(end));
              }
              p = ep + 1;
            }
            Some(b'+') => return self.max_expand(s + 1, p, ep),
            Some(b'*') => return self.max_expand(s, p, ep),
            Some(b'-') => return self.min_expand(s, p, ep),
            _ => {
              s += 1;
              p = ep;
            }
          }
        }
      }
    }
  }

  fn max_expand(&mut self, s: usize, p: usize, ep: usize) -> MatchResult {
    let mut count = 0;
    while self.single_match(s + count, p, ep) {
      self.tick()?;
      count += 1;
    }
    loop {
      if let Some(end) = self.matches(s + count, ep + 1)? {
        return Ok(Some(end));
      }
      if count == 0 {
        return Ok(None);
      }
      count -= 1;
    }
  }

  fn min_expand(&mut self, mut s: usize, p: usize, ep: usize) -> MatchResult {
    loop {
      if let Some(end) = self.matches(s, ep + 1)? {
        return Ok(Some(end));
      }
      if !self.single_match(s, p, ep) {
        return Ok(None);
      }
      s += 1;
    }
  }

  fn start_capture(&mut self, s: usize, p: usize, len: CaptureLen) -> MatchResult {
    if self.captures.len() >= MAX_CAPTURES {
      return Err(PatternError::malformed("too many captures"));
    }
    self.captures.push(Capture { init: s, len });
    let result = self.matches(s, p)?;
    if result.is_none() {
      self.captures.pop();
    }
    Ok(result)
  }

  fn end_capture(&mut self, s: usize, p: usize) -> MatchResult {
    let open = self
      .captures
      .iter()
      .rposition(|capture| matches!(capture.len, CaptureLen::Open))
      .ok_or_else(|| PatternError::malformed("invalid pattern capture"))?;
    self.captures[open].len = CaptureLen::Closed(s - self.captures[open].init);
    let result = self.matches(s, p)?;
    if result.is_none() {
      self.captures[open].len = CaptureLen::Open;
    }
    Ok(result)
  }

  fn match_back_reference(&self, s: usize, digit: u8) -> MatchResult {
    let capture = digit
      .checked_sub(b'1')
      .and_then(|index| self.captures.get(usize::from(index)))
      .filter(|capture| !matches!(capture.len, CaptureLen::Open))
      .copied()
      .ok_or_else(|| {
        PatternError::malformed(format!("invalid capture index %{} in pattern", digit as char))
      })?;
    let len = match capture.len {
      CaptureLen::Closed(len) => len,
      _ => 0,
    };
    let captured = &self.src[capture.init..capture.init + len];
    Ok(
      self
        .src
        .get(s..s + len)
        .filter(|candidate| *candidate == captured)
        .map(|_| s + len),
    )
  }

  fn match_balance(&mut self, s: usize, p: usize) -> MatchResult {
    if p + 1 >= self.pat.len() {
      return Err(PatternError::malformed(
        "malformed pattern (missing arguments to '%b')",
      ));
    }
    let (open, close) = (self.pat[p], self.pat[p + 1]);
    if self.src.get(s) != Some(&open) {
      return Ok(None);
    }
    let src = self.src;
    let mut depth = 1;
    for (offset, &c) in src[s + 1..].iter().enumerate() {
      self.tick()?;
      if c == close {
        depth -= 1;
        if depth == 0 {
          return Ok(Some(s + offset + 2));
        }
      } else if c == open {
        depth += 1;
      }
    }
    Ok(None)
  }

  /// Index just past the single-character class starting at `p`.
  fn class_end(&self, p: usize) -> Result<usize, PatternError> {
    let len = self.pat.len();
    let c = self.pat[p];
    let mut p = p + 1;
    if c == ESC {
      if p >= len {
        return Err(PatternError::malformed("malformed pattern (ends with '%')"));
      }
      return Ok(p + 1);
    }
    if c == b'[' {
      if self.pat.get(p) == Some(&b'^') {
        p += 1;
      }
      // The first character is always part of the set, so "[]]" works.
      loop {
        if p >= len {
          return Err(PatternError::malformed("malformed pattern (missing ']')"));
        }
        let c = self.pat[p];
        p += 1;
        if c == ESC && p < len {
          p += 1;
        }
        if self.pat.get(p) == Some(&b']') {
          break;
        }
      }
      return Ok(p + 1);
    }
    Ok(p)
  }

  fn single_match(&self, s: usize, p: usize, ep: usize) -> bool {
    let Some(&c) = self.src.get(s) else {
      return false;
    };
    match self.pat[p] {
      b'.' => true,
      ESC => match_class(c, self.pat[p + 1]),
      b'[' => self.match_bracket_class(c, p, ep - 1),
      literal => literal == c,
    }
  }

  /// `p` is the opening `[`, `end` the closing `]`.
  fn match_bracket_class(&self, c: u8, p: usize, end: usize) -> bool {
    let mut p = p + 1;
    let mut found = true;
    if self.pat[p] == b'^' {
      found = false;
      p += 1;
    }
    while p < end {
      if self.pat[p] == ESC {
        p += 1;
        if match_class(c, self.pat[p]) {
          return found;
        }
        p += 1;
      } else if self.pat[p + 1] == b'-' && p + 2 < end {
        if self.pat[p] <= c && c <= self.pat[p + 2] {
          return found;
        }
        p += 3;
      } else {
        if self.pat[p] == c {
          return found;
        }
        p += 1;
      }
    }
    !found
  }

  fn capture(
    &self,
    lua: &Lua,
    index: usize,
    whole: Option<(usize, usize)>,
  ) -> mlua::Result<LuaValue> {
    let Some(capture) = self.captures.get(index) else {
      return match whole {
        Some((start, end)) if index == 0 => {
          lua.create_string(&self.src[start..end]).map(LuaValue::String)
        }
        _ => Err(mlua::Error::runtime(format!("invalid capture index %{}", index + 1))),
      };
    };
    match capture.len {
      CaptureLen::Position => Ok(LuaValue::Integer(capture.init as i64 + 1)),
      CaptureLen::Open => Err(mlua::Error::runtime("unfinished capture")),
      CaptureLen::Closed(len) => lua
        .create_string(&self.src[capture.init..capture.init + len])
        .map(LuaValue::String),
    }
  }

  /// The captures of the last match, or the whole match when the pattern
  /// has none and `whole` is given.
  fn capture_values(
    &self,
    lua: &Lua,
    whole: Option<(usize, usize)>,
  ) -> mlua::Result<Variadic<LuaValue>> {
    let count = if self.captures.is_empty() && whole.is_some() {
      1
    } else {
      self.captures.len()
    };
    (0..count).map(|index| self.capture(lua, index, whole)).collect()
  }
}

fn match_class(c: u8, class: u8) -> bool {
  let matched = match class.to_ascii_lowercase() {
    b'a' => c.is_ascii_alphabetic(),
    b'c' => c.is_ascii_control(),
    b'd' => c.is_ascii_digit(),
    b'g' => c.is_ascii_graphic(),
    b'l' => c.is_ascii_lowercase(),
    b'p' => c.is_ascii_punctuation(),
    b's' => matches!(c, b' ' | b'\t'..=b'\r'),
    b'u' => c.is_ascii_uppercase(),
    b'w' => c.is_ascii_alphanumeric(),
    b'x' => c.is_ascii_hexdigit(),
    _ => return class == c,
  };
  if class.is_ascii_uppercase() { !matched } else { matched }
}

/// 1-based start position from a possibly negative `init`.
fn start_position(init: i64, len: usize) -> usize {
  let len = len as i64;
  if init > 0 {
    init as usize
  } else if init == 0 || init < -len {
    1
  } else {
    (len + init + 1) as usize
  }
}

fn split_anchor(pat: &[u8]) -> (bool, &[u8]) {
  match pat.split_first() {
    Some((b'^', rest)) => (true, rest),
    _ => (false, pat),
  }
}

fn is_truthy(value: &LuaValue) -> bool {
  !matches!(value, LuaValue::Nil | LuaValue::Boolean(false))
}

fn nil() -> Variadic<LuaValue> {
  Variadic::from_iter([LuaValue::Nil])
}

fn find_plain(
  haystack: &[u8],
  needle: &[u8],
  deadline: Instant,
) -> Result<Option<usize>, PatternError> {
  if needle.is_empty() {
    return Ok(Some(0));
  }
  for (offset, window) in haystack.windows(needle.len()).enumerate() {
    if offset as u64 % DEADLINE_CHECK_INTERVAL == 0 && Instant::now() >= deadline {
      return Err(PatternError::Deadline);
    }
    if window == needle {
      return Ok(Some(offset));
    }
  }
  Ok(None)
}

/// Shared body of `string.find` and `string.match`.
fn find(
  lua: &Lua,
  src: &[u8],
  pat: &[u8],
  init: Option<i64>,
  plain: bool,
  positions: bool,
  deadline: Instant,
) -> mlua::Result<Variadic<LuaValue>> {
  let init = start_position(init.unwrap_or(1), src.len());
  if init > src.len() + 1 {
    return Ok(nil());
  }
  let first = init - 1;

  if positions && (plain || !pat.iter().any(|c| SPECIALS.contains(c))) {
    return Ok(match find_plain(&src[first..], pat, deadline)? {
      Some(offset) => {
        let start = first + offset;
        Variadic::from_iter([
          LuaValue::Integer(start as i64 + 1),
          LuaValue::Integer((start + pat.len()) as i64),
        ])
      }
      None => nil(),
    });
  }

  let (anchored, pat) = split_anchor(pat);
  let mut matcher = Matcher::new(src, pat, deadline);
  let mut start = first;
  loop {
    matcher.reset();
    if let Some(end) = matcher.matches(start, 0)? {
      if !positions {
        return matcher.capture_values(lua, Some((start, end)));
      }
      let mut values = Variadic::from_iter([
        LuaValue::Integer(start as i64 + 1),
        LuaValue::Integer(end as i64),
      ]);
      values.extend(matcher.capture_values(lua, None)?.iter().cloned());
      return Ok(values);
    }
    start += 1;
    if anchored || start > src.len() {
      return Ok(nil());
    }
  }
}

fn gmatch(
  lua: &Lua,
  src: Vec<u8>,
  pat: Vec<u8>,
  init: Option<i64>,
  deadline: Instant,
) -> mlua::Result<Function> {
  let mut position = start_position(init.unwrap_or(1), src.len()).min(src.len() + 1) - 1;
  let mut last_match = None;
  lua.create_function_mut(move |lua, ()| {
    let mut matcher = Matcher::new(&src, &pat, deadline);
    while position <= src.len() {
      matcher.reset();
      if let Some(end) = matcher.matches(position, 0)?
        && last_match != Some(end)
      {
        let values = matcher.capture_values(lua, Some((position, end)))?;
        position = end;
        last_match = Some(end);
        return Ok(values);
      }
      position += 1;
    }
    Ok(nil())
  })
}

enum Replacement {
  Text(Vec<u8>),
  Table(Table),
  Function(Function),
}

impl Replacement {
  fn from_value(lua: &Lua, value: LuaValue) -> mlua::Result<Self> {
    match value {
      LuaValue::Table(table) => Ok(Replacement::Table(table)),
      LuaValue::Function(function) => Ok(Replacement::Function(function)),
      LuaValue::String(_) | LuaValue::Integer(_) | LuaValue::Number(_) => {
        match lua.coerce_string(value)? {
          Some(text) => Ok(Replacement::Text(text.as_bytes().to_vec())),
          None => Err(mlua::Error::runtime("invalid replacement value")),
        }
      }
      other => Err(mlua::Error::runtime(format!(
        "bad argument #3 to 'gsub' (string/function/table expected, got {})",
        other.type_name()
      ))),
    }
  }
}

impl Matcher<'_> {
  /// Append the replacement for the match `src[start..end]` to `out`.
  fn replace(
    &self,
    lua: &Lua,
    replacement: &Replacement,
    (start, end): (usize, usize),
    out: &mut Vec<u8>,
  ) -> mlua::Result<()> {
    let value: LuaValue = match replacement {
      Replacement::Text(text) => return self.expand(lua, text, (start, end), out),
      Replacement::Table(table) => table.get(self.capture(lua, 0, Some((start, end)))?)?,
      Replacement::Function(function) => {
        function.call(self.capture_values(lua, Some((start, end)))?)?
      }
    };
    match value {
      LuaValue::Nil | LuaValue::Boolean(false) => out.extend_from_slice(&self.src[start..end]),
      LuaValue::String(text) => out.extend_from_slice(&text.as_bytes()),
      LuaValue::Integer(_) | LuaValue::Number(_) => {
        if let Some(text) = lua.coerce_string(value)? {
          out.extend_from_slice(&text.as_bytes());
        }
      }
      other => {
        return Err(mlua::Error::runtime(format!(
          "invalid replacement value (a {})",
          other.type_name()
        )));
      }
    }
    Ok(())
  }

  /// Expand `%0`-`%9` and `%%` in a replacement string.
  fn expand(
    &self,
    lua: &Lua,
    text: &[u8],
    whole: (usize, usize),
    out: &mut Vec<u8>,
  ) -> mlua::Result<()> {
    let mut bytes = text.iter().copied();
    while let Some(c) = bytes.next() {
      if c != ESC {
        out.push(c);
        continue;
      }
      match bytes.next() {
        Some(ESC) => out.push(ESC),
        Some(b'0') => out.extend_from_slice(&self.src[whole.0..whole.1]),
        Some(digit @ b'1'..=b'9') => {
          match self.capture(lua, usize::from(digit - b'1'), Some(whole))? {
            LuaValue::String(capture) => out.extend_from_slice(&capture.as_bytes()),
            LuaValue::Integer(position) => out.extend_from_slice(position.to_string().as_bytes()),
            _ => {}
          }
        }
        _ => {
          return Err(mlua::Error::runtime(
            "invalid use of '%' in replacement string",
          ));
        }
      }
    }
    Ok(())
  }
}

fn gsub(
  lua: &Lua,
  src: &[u8],
  pat: &[u8],
  replacement: &Replacement,
  max: Option<i64>,
  deadline: Instant,
) -> mlua::Result<(LuaString, i64)> {
  let (anchored, pat) = split_anchor(pat);
  let max = max.unwrap_or(src.len() as i64 + 1);
  let mut matcher = Matcher::new(src, pat, deadline);
  let mut out = Vec::with_capacity(src.len());
  let mut position = 0;
  let mut last_match = None;
  let mut count = 0;

  while count < max {
    matcher.reset();
    match matcher.matches(position, 0)? {
      Some(end) if last_match != Some(end) => {
        count += 1;
        matcher.replace(lua, replacement, (position, end), &mut out)?;
        position = end;
        last_match = Some(end);
      }
      _ if position < src.len() => {
        out.push(src[position]);
        position += 1;
      }
      _ => break,
    }
    if anchored {
      break;
    }
  }
  out.extend_from_slice(&src[position..]);

  Ok((lua.create_string(&out)?, count))
}

/// Replace the pattern functions of the `string` library.
///
/// The library table is shared with the string metatable, so method calls
/// such as `s:gsub(...)` use the replacements too.
pub(crate) fn install(lua: &Lua, string_lib: &Table, deadline: Instant) -> mlua::Result<()> {
  let find_fn = lua.create_function(
    move |lua, (s, p, init, plain): (LuaString, LuaString, Option<i64>, LuaValue)| {
      let (src, pat) = (s.as_bytes().to_vec(), p.as_bytes().to_vec());
      find(lua, &src, &pat, init, is_truthy(&plain), true, deadline)
    },
  )?;

  let match_fn = lua.create_function(
    move |lua, (s, p, init): (LuaString, LuaString, Option<i64>)| {
      let (src, pat) = (s.as_bytes().to_vec(), p.as_bytes().to_vec());
      find(lua, &src, &pat, init, false, false, deadline)
    },
  )?;

  let gmatch_fn = lua.create_function(
    move |lua, (s, p, init): (LuaString, LuaString, Option<i64>)| {
      gmatch(lua, s.as_bytes().to_vec(), p.as_bytes().to_vec(), init, deadline)
    },
  )?;

  let gsub_fn = lua.create_function(
    move |lua, (s, p, repl, max): (LuaString, LuaString, LuaValue, Option<i64>)| {
      let (src, pat) = (s.as_bytes().to_vec(), p.as_bytes().to_vec());
      let replacement = Replacement::from_value(lua, repl)?;
      gsub(lua, &src, &pat, &replacement, max, deadline)
    },
  )?;

  string_lib.raw_set("find", find_fn)?;
  string_lib.raw_set("match", match_fn)?;
  string_lib.raw_set("gmatch", gmatch_fn)?;
  string_lib.raw_set("gsub", gsub_fn)?;
  Ok(())
}
