//! Shared test setup for the ledger replay crates.
// Standard lints
#![warn(missing_docs)]
#![allow(clippy::try_err)]
#![deny(clippy::await_holding_lock)]
#![forbid(unsafe_code)]

use std::{collections::HashSet, sync::Once};

use color_eyre::{config::Frame, section::PanicMessage};
use owo_colors::OwoColorize;
use tracing_error::ErrorLayer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub mod prelude;

static INIT: Once = Once::new();

/// Backtrace frames from the test harness, proptest runners, and the tokio
/// test runtime, which never point at replay code.
const HARNESS_FRAMES: &[&str] = &[
    "test::run_test_in_process",
    "test::assert_test_result",
    "core::ops::function::FnOnce::call_once",
    "std::panic",
    "proptest::",
    "tokio::",
];

/// Initialize globals for tests such as the tracing subscriber and panic / error
/// reporting hooks.
///
/// Safe to call from every test: only the first call has any effect.
pub fn init() {
    INIT.call_once(|| {
        let fmt_layer = fmt::layer().with_target(false).with_test_writer();
        // Use the RUST_LOG env var, or by default:
        //  - warn for most tests, and
        //  - hide the expected failure logs from replay tests that exercise bad peers
        let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("warn").add_directive(
                "ledger_replay=error"
                    .parse()
                    .expect("hard-coded directive is valid"),
            )
        });

        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .with(ErrorLayer::default())
            .init();

        color_eyre::config::HookBuilder::default()
            .add_frame_filter(Box::new(hide_harness_frames))
            .panic_message(TestPanicMessage)
            .install()
            .expect("eyre hooks are only installed once");
    })
}

/// Drops repeated frames, and frames from [`HARNESS_FRAMES`].
///
/// Proptest shrinking re-runs the same test body, so backtraces repeat.
fn hide_harness_frames(frames: &mut Vec<&Frame>) {
    let mut seen = HashSet::new();

    frames.retain(|frame| {
        if !seen.insert((frame.lineno, &frame.filename)) {
            return false;
        }

        match frame.name.as_deref() {
            Some(name) => !HARNESS_FRAMES.iter().any(|prefix| name.starts_with(prefix)),
            None => false,
        }
    });
}

/// Prints panics, except the generic panic from a test that returned `Err`.
///
/// The test harness prints the returned error report itself.
struct TestPanicMessage;

impl PanicMessage for TestPanicMessage {
    fn display(
        &self,
        pi: &std::panic::PanicInfo<'_>,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        let payload = pi
            .payload()
            .downcast_ref::<String>()
            .map(String::as_str)
            .or_else(|| pi.payload().downcast_ref::<&str>().copied())
            .unwrap_or("<non string panic payload>");

        if payload.contains("the test returned a termination value with a non-zero status code") {
            return write!(f, "---- end of test output ----");
        }

        writeln!(f, "{}", "\nThe test panicked.".red())?;
        writeln!(f, "Message:  {}", payload.cyan())?;

        match pi.location() {
            Some(location) => write!(
                f,
                "Location: {}:{}",
                location.file().purple(),
                location.line().purple()
            ),
            None => write!(f, "Location: <unknown>"),
        }
    }
}
