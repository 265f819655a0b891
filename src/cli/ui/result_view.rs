use std::fmt::{self, Display, Formatter};

use crate::cli::control::ControlResult;
use crate::utils::format_rssi;

use super::painter::{Painter, Tone};

const TICK: &str = "✓";

/// Human-readable rendering of one command result.
pub(crate) struct ResultView<'a> {
    result: &'a ControlResult,
    painter: Painter,
}

impl<'a> ResultView<'a> {
    pub(crate) fn new(result: &'a ControlResult, painter: Painter) -> Self {
        Self { result, painter }
    }

    fn tick(&self) -> String {
        self.painter.paint(Tone::Success, TICK)
    }
}

impl Display for ResultView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let painter = &self.painter;
        match self.result {
            ControlResult::Pair {
                address,
                name,
                rssi,
                token_store,
            } => {
                writeln!(
                    f,
                    "{} Paired {} {}",
                    self.tick(),
                    painter.paint(Tone::Emphasis, address.as_str()),
                    painter.paint(
                        Tone::Muted,
                        format!(
                            "({}, {})",
                            name.as_deref().unwrap_or("<unnamed>"),
                            format_rssi(*rssi)
                        )
                    ),
                )?;
                write!(
                    f,
                    "  token stored in {}",
                    painter.paint(Tone::Muted, token_store.display().to_string())
                )
            }
            ControlResult::Push { address, state, .. } => write!(
                f,
                "{} Pushed {}: {}",
                self.tick(),
                painter.paint(Tone::Emphasis, address.as_str()),
                painter.paint(Tone::Success, state.to_string()),
            ),
            ControlResult::Calibrate {
                address,
                parameters,
            } => write!(
                f,
                "{} Calibrated {}: depth {}%, duration {}, mode {}",
                self.tick(),
                painter.paint(Tone::Emphasis, address.as_str()),
                parameters.depth(),
                parameters.duration(),
                parameters.mode(),
            ),
            ControlResult::Token {
                address,
                stored: true,
                ..
            } => write!(
                f,
                "{} Token stored for {}",
                self.tick(),
                painter.paint(Tone::Emphasis, address.as_str()),
            ),
            ControlResult::Token {
                address,
                stored: false,
                ..
            } => write!(
                f,
                "{} No token stored for {}; run `microbot pair {}` first",
                painter.paint(Tone::Warning, "!"),
                painter.paint(Tone::Emphasis, address.as_str()),
                address,
            ),
        }
    }
}
