use console::Term;
use owo_colors::Style;
use std::sync::OnceLock;

static STDOUT: OnceLock<Theme> = OnceLock::new();
static STDERR: OnceLock<Theme> = OnceLock::new();

/// Styles for each kind of text the admin CLI prints.
#[derive(Debug, Clone)]
pub struct Theme {
    pub title: Style,
    pub ok: Style,
    pub fail: Style,
    pub caution: Style,
    pub label: Style,
    pub figure: Style,
    pub muted: Style,
}

impl Theme {
    /// Colors only when `term` is interactive and colors are not disabled.
    pub fn detect(term: &Term) -> Self {
        if term.is_term() && console::colors_enabled() {
            Self::colored()
        } else {
            Self::plain()
        }
    }

    pub fn colored() -> Self {
        Self {
            title: Style::new().cyan().bold(),
            ok: Style::new().green().bold(),
            fail: Style::new().red().bold(),
            caution: Style::new().yellow().bold(),
            label: Style::new().white().dimmed(),
            figure: Style::new().bold(),
            muted: Style::new().bright_black(),
        }
    }

    pub fn plain() -> Self {
        let none = Style::new();
        Self {
            title: none.clone(),
            ok: none.clone(),
            fail: none.clone(),
            caution: none.clone(),
            label: none.clone(),
            figure: none.clone(),
            muted: none,
        }
    }
}

pub fn theme() -> &'static Theme {
    STDOUT.get_or_init(|| Theme::detect(&Term::stdout()))
}

/// Theme for diagnostics written to stderr.
pub fn err_theme() -> &'static Theme {
    STDERR.get_or_init(|| Theme::detect(&Term::stderr()))
}
