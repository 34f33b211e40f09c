//! The child side of the process protocol.
//!
//! A binary that should act as a process stage calls [`serve_stdio`] with
//! its stage function. The usual setup re-executes the running binary:
//!
//! ```no_run
//! use conveyor::worker::{serve_stdio, ProcessCommand};
//!
//! fn square(x: i64) -> anyhow::Result<i64> {
//!     Ok(x * x)
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     if std::env::var_os("SQUARE_WORKER").is_some() {
//!         serve_stdio(square)?;
//!         return Ok(());
//!     }
//!     let _command = ProcessCommand::current_exe()?.env("SQUARE_WORKER", "1");
//!     // ... build a pipeline with `process_stage(config, command)`
//!     Ok(())
//! }
//! ```

use super::{panic_message, Reply};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, BufRead, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Serves a stage function over standard input and output until input ends.
///
/// Every input line is one JSON item; every item gets exactly one reply line.
/// Function errors are answered with `{"error": ..}` and panics with
/// `{"panic": ..}`, so one bad item never ends the child.
///
/// # Errors
///
/// Returns an error if reading stdin or writing stdout fails.
pub fn serve_stdio<I, O, F>(func: F) -> io::Result<u64>
where
    I: DeserializeOwned,
    O: Serialize,
    F: Fn(I) -> anyhow::Result<O>,
{
    let stdin = io::stdin();
    let stdout = io::stdout();
    serve(stdin.lock(), stdout.lock(), func)
}

/// Serves a stage function over any line reader and writer.
///
/// Returns the number of items answered. Blank lines are skipped.
///
/// # Errors
///
/// Returns an error if reading or writing fails.
pub fn serve<R, W, I, O, F>(reader: R, mut writer: W, func: F) -> io::Result<u64>
where
    R: BufRead,
    W: Write,
    I: DeserializeOwned,
    O: Serialize,
    F: Fn(I) -> anyhow::Result<O>,
{
    let mut answered = 0;
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let reply = answer(&line, &func);
        serde_json::to_writer(&mut writer, &reply)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        answered += 1;
    }
    Ok(answered)
}

fn answer<I, O, F>(line: &str, func: &F) -> Reply<serde_json::Value>
where
    I: DeserializeOwned,
    O: Serialize,
    F: Fn(I) -> anyhow::Result<O>,
{
    let item: I = match serde_json::from_str(line) {
        Ok(item) => item,
        Err(err) => return Reply::Error(format!("could not decode item: {err}")),
    };

    match catch_unwind(AssertUnwindSafe(|| func(item))) {
        Ok(Ok(value)) => match serde_json::to_value(value) {
            Ok(value) => Reply::Ok(value),
            Err(err) => Reply::Error(format!("could not encode result: {err}")),
        },
        Ok(Err(err)) => Reply::Error(format!("{err:#}")),
        Err(payload) => Reply::Panic(panic_message(payload.as_ref())),
    }
}
