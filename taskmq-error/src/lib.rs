// Copyright 2024 The taskmq Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error taxonomy shared by every taskmq crate. Every fallible operation
//! across the engine returns `Result<T, Error>` tagged with one of `Code`'s
//! variants instead of a bespoke error type per module.

use std::fmt;

/// The kind of failure that occurred. This is not a transport status code,
/// but it is deliberately shaped like one so adapters can map it onto a
/// transport's status codes at the boundary (eg. HTTP, gRPC) without this
/// crate knowing about either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    /// Caller misuse: unknown queue, malformed chain, bad percentage, etc.
    InvalidArgument,
    /// Task or other referenced resource does not exist.
    NotFound,
    /// Uniqueness collision, concurrent-processing guard trip, rate-limit
    /// denial.
    Conflict,
    /// Storage or dispatcher I/O failure.
    Backend,
    /// The registered handler raised an error; not a library bug.
    HandlerFailure,
    /// A caller is being asked to back off; distinct from `Conflict` so
    /// retry_action-style accounting can special-case it.
    ResourceExhausted,
    /// The operation was cancelled before completion (eg. engine shutdown).
    Cancelled,
    /// Anything that doesn't fit the above; typically a bug or an invariant
    /// violation surfaced via `error_if!`.
    Internal,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A taskmq error. Carries a `Code` plus a stack of context messages, the
/// innermost pushed first, each subsequent `err_tip()` call appending one
/// more line of context as the error travels up the call stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    pub code: Code,
    pub messages: Vec<String>,
}

impl Error {
    #[must_use]
    pub fn new(code: Code, message: String) -> Self {
        Error {
            code,
            messages: vec![message],
        }
    }

    /// Combines two errors into one, keeping `self`'s code and appending
    /// `other`'s messages. Used when a higher-level retry/cancellation
    /// error needs to retain the root cause.
    #[must_use]
    pub fn merge(mut self, mut other: Error) -> Self {
        self.messages.append(&mut other.messages);
        self
    }

    #[must_use]
    pub fn append(mut self, message: impl Into<String>) -> Self {
        self.messages.push(message.into());
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error {{ code: {:?}, messages: [{}] }}", self.code, self.messages.join(", "))
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::new(Code::Backend, err.to_string())
    }
}

/// Builds an `Error` with an explicit `Code` and a `format!`-style message.
#[macro_export]
macro_rules! make_err {
    ($code:expr, $($arg:tt)+) => {
        $crate::Error::new($code, format!($($arg)+))
    };
}

/// Sugar for `make_err!(Code::InvalidArgument, ...)`, the most common case
/// for caller-misuse errors surfaced directly to `AddTask`/`AddChain`.
#[macro_export]
macro_rules! make_input_err {
    ($($arg:tt)+) => {
        $crate::make_err!($crate::Code::InvalidArgument, $($arg)+)
    };
}

/// Early-return with an `InvalidArgument` error if `cond` holds. Intended
/// for guarding invariants at the top of a function, eg. chain index
/// bounds, percentage ranges.
#[macro_export]
macro_rules! error_if {
    ($cond:expr, $($arg:tt)+) => {
        if $cond {
            return Err($crate::make_input_err!($($arg)+));
        }
    };
}

/// Adds a context message ("tip") to a `Result`'s error without losing the
/// original `Code` or message stack. The closure is only evaluated on the
/// error path, so it's safe to put expensive formatting in it.
pub trait ResultExt<T> {
    fn err_tip<F, S>(self, f: F) -> Result<T, Error>
    where
        F: FnOnce() -> S,
        S: Into<String>;

    /// Like `err_tip`, but also allows overriding the `Code` based on the
    /// error being wrapped.
    fn err_tip_with_code<F, S>(self, f: F) -> Result<T, Error>
    where
        F: FnOnce(&Error) -> (Code, S),
        S: Into<String>;
}

impl<T> ResultExt<T> for Result<T, Error> {
    fn err_tip<F, S>(self, f: F) -> Result<T, Error>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.append(f().into()))
    }

    fn err_tip_with_code<F, S>(self, f: F) -> Result<T, Error>
    where
        F: FnOnce(&Error) -> (Code, S),
        S: Into<String>,
    {
        self.map_err(|e| {
            let (code, message) = f(&e);
            Error {
                code,
                messages: e.messages,
            }
            .append(message.into())
        })
    }
}

impl<T> ResultExt<T> for Option<T> {
    fn err_tip<F, S>(self, f: F) -> Result<T, Error>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.ok_or_else(|| Error::new(Code::NotFound, f().into()))
    }

    fn err_tip_with_code<F, S>(self, f: F) -> Result<T, Error>
    where
        F: FnOnce(&Error) -> (Code, S),
        S: Into<String>,
    {
        self.ok_or_else(|| {
            let placeholder = Error::new(Code::NotFound, String::new());
            let (code, message) = f(&placeholder);
            Error::new(code, message.into())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn make_err_carries_code_and_message() {
        let err = make_err!(Code::Conflict, "duplicate key {}", "abc");
        assert_eq!(err.code, Code::Conflict);
        assert_eq!(err.messages, vec!["duplicate key abc".to_string()]);
    }

    #[test]
    fn err_tip_appends_context() {
        let result: Result<(), Error> = Err(make_input_err!("bad value"));
        let result = result.err_tip(|| "while validating queue config");
        let err = result.unwrap_err();
        assert_eq!(
            err.messages,
            vec![
                "bad value".to_string(),
                "while validating queue config".to_string(),
            ]
        );
    }

    #[test]
    fn error_if_short_circuits() {
        fn check(v: i32) -> Result<(), Error> {
            error_if!(v < 0, "value must be non-negative, got {v}");
            Ok(())
        }
        assert!(check(5).is_ok());
        assert_eq!(check(-1).unwrap_err().code, Code::InvalidArgument);
    }

    #[test]
    fn option_err_tip_maps_to_not_found() {
        let opt: Option<i32> = None;
        let result = opt.err_tip(|| "task missing");
        assert_eq!(result.unwrap_err().code, Code::NotFound);
    }
}
