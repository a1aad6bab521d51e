use nu_ansi_term::{Color, Style};
use std::fmt::Display;
use std::io::IsTerminal;

#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum Theme {
    Auto,
    Plain,
}

/// How a session row is marked in listings.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mark {
    Live,
    Permanent,
    Destroyed,
    Protected,
}

impl Mark {
    fn glyph(self, paint: bool) -> &'static str {
        match (self, paint) {
            (Mark::Live, true) => "●",
            (Mark::Permanent, true) => "◆",
            (Mark::Destroyed, true) => "○",
            (Mark::Protected, true) => "◎",
            (Mark::Live, false) => "*",
            (Mark::Permanent, false) => "#",
            (Mark::Destroyed, false) => "-",
            (Mark::Protected, false) => "@",
        }
    }
}

pub struct Ui {
    palette: Palette,
    paint: bool,
}

impl Ui {
    pub fn new(theme: Theme) -> Self {
        let paint = theme == Theme::Auto && std::io::stdout().is_terminal();

        #[cfg(windows)]
        if paint {
            let _ = nu_ansi_term::enable_ansi_support();
        }

        let palette = if paint { Palette::dark() } else { Palette::plain() };
        Self { palette, paint }
    }

    /// Aligned `key: value` block under a heading; nothing if `rows` is empty.
    pub fn section<'a, I, V>(&self, title: &str, rows: I)
    where
        I: IntoIterator<Item = (&'a str, V)>,
        V: Display,
    {
        let rows: Vec<(&str, String)> = rows.into_iter().map(|(k, v)| (k, v.to_string())).collect();
        if rows.is_empty() {
            return;
        }
        self.heading(title);
        let width = rows.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
        for (key, value) in rows {
            println!(
                "  {} {value}",
                self.palette.key.paint(format!("{key:>width$}:"))
            );
        }
    }

    /// One row per session, glyph and colour chosen by its mark.
    pub fn sessions<I>(&self, title: &str, rows: I)
    where
        I: IntoIterator<Item = (Mark, String)>,
    {
        let rows: Vec<(Mark, String)> = rows.into_iter().collect();
        if rows.is_empty() {
            return;
        }
        self.heading(title);
        for (mark, text) in rows {
            let style = self.palette.for_mark(mark);
            println!(
                "  {} {}",
                style.paint(mark.glyph(self.paint)),
                style.paint(text)
            );
        }
    }

    pub fn success(&self, message: &str) {
        println!("{} {message}", self.palette.good.paint("✔"));
    }

    pub fn warn(&self, message: &str) {
        eprintln!("{} {message}", self.palette.warn.paint("⚠"));
    }

    fn heading(&self, title: &str) {
        println!("{}", self.palette.heading.paint(format!("▸ {title}")));
    }
}

struct Palette {
    heading: Style,
    key: Style,
    good: Style,
    warn: Style,
    permanent: Style,
    destroyed: Style,
}

impl Palette {
    fn dark() -> Self {
        Self {
            heading: Style::new().fg(Color::Purple).bold(),
            key: Style::new().fg(Color::LightBlue).bold(),
            good: Style::new().fg(Color::LightGreen).bold(),
            warn: Style::new().fg(Color::Yellow).bold(),
            permanent: Style::new().fg(Color::LightCyan).bold(),
            destroyed: Style::new().fg(Color::DarkGray),
        }
    }

    fn plain() -> Self {
        Self {
            heading: Style::new(),
            key: Style::new(),
            good: Style::new(),
            warn: Style::new(),
            permanent: Style::new(),
            destroyed: Style::new(),
        }
    }

    fn for_mark(&self, mark: Mark) -> Style {
        match mark {
            Mark::Live => self.good,
            Mark::Permanent => self.permanent,
            Mark::Destroyed => self.destroyed,
            Mark::Protected => self.warn,
        }
    }
}
