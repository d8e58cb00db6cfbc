//! Logging setup and id formatting helpers.
//!
//! Log output goes through `tracing`.  [`init`] installs a `fmt` subscriber on
//! stderr filtered by `RUST_LOG` (default `info`).  When stderr is a terminal
//! user and message ids are colour-coded by content so the same id always
//! renders in the same colour:
//!
//! ```text
//! 2026-10-17T09:12:44.120Z  INFO sevo::lifecycle: message sent from=u-4f1c2a9 to=u-9be03d1 id=m-c1d2e3f
//! ```

use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::EnvFilter;

static COLOUR_ENABLED: AtomicBool = AtomicBool::new(false);

/// Install the global subscriber.  Safe to call more than once; later calls
/// are ignored.
pub fn init() {
    let is_terminal = std::io::stderr().is_terminal();
    COLOUR_ENABLED.store(is_terminal, Ordering::Relaxed);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(is_terminal)
        .try_init();
}

pub fn colour_enabled() -> bool {
    COLOUR_ENABLED.load(Ordering::Relaxed)
}

const RESET: &str = "\x1b[0m";

const ID_COLOURS: &[&str] = &[
    "\x1b[91m", "\x1b[92m", "\x1b[93m", "\x1b[94m", "\x1b[95m", "\x1b[96m", "\x1b[31m",
    "\x1b[32m", "\x1b[33m", "\x1b[34m", "\x1b[35m", "\x1b[36m",
];

fn hash_colour(id: &str) -> &'static str {
    let hash: u32 = id
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
    ID_COLOURS[(hash as usize) % ID_COLOURS.len()]
}

const LOG_ID_TRUNCATE_LEN: usize = 7;

fn truncate_id(id: &str) -> &str {
    let end = id
        .char_indices()
        .nth(LOG_ID_TRUNCATE_LEN)
        .map(|(i, _)| i)
        .unwrap_or(id.len());
    &id[..end]
}

fn render(prefix: char, id: &str, colour: bool) -> String {
    let short = truncate_id(id);
    if colour {
        format!("{}{prefix}-{short}{RESET}", hash_colour(id))
    } else {
        format!("{prefix}-{short}")
    }
}

/// Short rendering of a user id, e.g. `u-4f1c2a9`.
pub fn user_id(id: &str) -> String {
    render('u', id, colour_enabled())
}

/// Short rendering of a message id, e.g. `m-c1d2e3f`.
pub fn msg_id(id: &str) -> String {
    render('m', id, colour_enabled())
}
