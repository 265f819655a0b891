use owo_colors::{OwoColorize, Style};

/// Semantic styles used by command output.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum Tone {
    Success,
    Warning,
    Emphasis,
    Muted,
}

impl Tone {
    fn style(self) -> Style {
        match self {
            Self::Success => Style::new().bold().green(),
            Self::Warning => Style::new().bold().yellow(),
            Self::Emphasis => Style::new().bold(),
            Self::Muted => Style::new().dimmed(),
        }
    }
}

/// Applies terminal styling when stdout is a terminal.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Painter {
    use_colour: bool,
}

impl Painter {
    pub(crate) fn new(use_colour: bool) -> Self {
        Self { use_colour }
    }

    pub(crate) fn paint(&self, tone: Tone, text: impl AsRef<str>) -> String {
        let text = text.as_ref();
        if self.use_colour {
            text.style(tone.style()).to_string()
        } else {
            text.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::success(Tone::Success)]
    #[case::warning(Tone::Warning)]
    #[case::emphasis(Tone::Emphasis)]
    #[case::muted(Tone::Muted)]
    fn plain_painter_leaves_text_untouched(#[case] tone: Tone) {
        assert_eq!("aabbccddeeff", Painter::new(false).paint(tone, "aabbccddeeff"));
    }

    #[rstest]
    #[case::success(Tone::Success)]
    #[case::muted(Tone::Muted)]
    fn colour_painter_wraps_text_in_escapes(#[case] tone: Tone) {
        let styled = Painter::new(true).paint(tone, "on");
        assert_ne!("on", styled);
        assert!(styled.contains("on"));
    }
}
