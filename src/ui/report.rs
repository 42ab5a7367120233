//! Report lines and their rendering

use super::context::UiContext;
use console::style;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Ok,
    Warn,
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Heading(String),
    Step {
        tone: Tone,
        text: String,
        detail: Option<String>,
    },
    /// Dimmed item under a heading, e.g. a pruned `tenant|owner` pair
    Item(String),
    Field {
        key: String,
        value: String,
    },
}

/// Output of one command: a title, body lines and an optional closing line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    title: Option<String>,
    lines: Vec<Line>,
    closing: Option<(Tone, String)>,
}

impl Report {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    /// A report without title, for single-result commands
    pub fn bare() -> Self {
        Self::default()
    }

    pub fn heading(&mut self, text: impl Into<String>) -> &mut Self {
        self.lines.push(Line::Heading(text.into()));
        self
    }

    pub fn step(&mut self, tone: Tone, text: impl Into<String>) -> &mut Self {
        self.lines.push(Line::Step {
            tone,
            text: text.into(),
            detail: None,
        });
        self
    }

    pub fn step_with(
        &mut self,
        tone: Tone,
        text: impl Into<String>,
        detail: impl Into<String>,
    ) -> &mut Self {
        self.lines.push(Line::Step {
            tone,
            text: text.into(),
            detail: Some(detail.into()),
        });
        self
    }

    pub fn item(&mut self, text: impl Into<String>) -> &mut Self {
        self.lines.push(Line::Item(text.into()));
        self
    }

    pub fn field(&mut self, key: impl Into<String>, value: impl ToString) -> &mut Self {
        self.lines.push(Line::Field {
            key: key.into(),
            value: value.to_string(),
        });
        self
    }

    pub fn close(&mut self, tone: Tone, text: impl Into<String>) -> &mut Self {
        self.closing = Some((tone, text.into()));
        self
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn lines(&self) -> &[Line] {
        &self.lines
    }

    pub fn closing(&self) -> Option<(Tone, &str)> {
        self.closing.as_ref().map(|(tone, text)| (*tone, text.as_str()))
    }

    pub fn print(&self, ctx: &UiContext) {
        if ctx.use_fancy_output() {
            self.print_fancy();
        } else {
            self.plain_lines().iter().for_each(|line| println!("{}", line));
        }
    }

    fn print_fancy(&self) {
        if let Some(title) = &self.title {
            cliclack::intro(style(title).cyan().bold()).ok();
        }
        for line in &self.lines {
            match line {
                Line::Heading(text) => {
                    println!();
                    cliclack::log::info(style(text).bold()).ok();
                }
                Line::Step { tone, text, detail } => {
                    let text = match detail {
                        Some(detail) => format!("{} ({})", text, style(detail).dim()),
                        None => text.clone(),
                    };
                    match tone {
                        Tone::Ok => cliclack::log::success(text),
                        Tone::Warn => cliclack::log::warning(text),
                        Tone::Info => cliclack::log::info(text),
                    }
                    .ok();
                }
                Line::Item(text) => {
                    cliclack::log::remark(text).ok();
                }
                Line::Field { key, value } => println!("  {}: {}", style(key).dim(), value),
            }
        }
        if let Some((tone, text)) = &self.closing {
            let text = match tone {
                Tone::Warn => style(text).yellow().bold(),
                _ => style(text).green().bold(),
            };
            cliclack::outro(text).ok();
        }
    }

    /// Unstyled rendering used when stdout is piped or in CI
    pub fn plain_lines(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(title) = &self.title {
            out.push(title.clone());
            out.push(String::new());
        }
        for line in &self.lines {
            match line {
                Line::Heading(text) => {
                    out.push(String::new());
                    out.push(text.clone());
                }
                Line::Step { tone, text, detail } => {
                    let text = match detail {
                        Some(detail) => format!("{} ({})", text, detail),
                        None => text.clone(),
                    };
                    out.push(format!("  {} {}", tag(*tone), text));
                }
                Line::Item(text) => out.push(format!("  {}", text)),
                Line::Field { key, value } => out.push(format!("  {}: {}", key, value)),
            }
        }
        if let Some((tone, text)) = &self.closing {
            out.push(String::new());
            out.push(format!("{} {}", tag(*tone), text));
        }
        out
    }
}

fn tag(tone: Tone) -> &'static str {
    match tone {
        Tone::Ok => "[OK]",
        Tone::Warn => "[WARN]",
        Tone::Info => "[INFO]",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_rendering_tags_each_tone() {
        let mut report = Report::titled("Garbage collection");
        report
            .step_with(Tone::Ok, "Removed shared binaries", "1.0")
            .step(Tone::Warn, "dk-a no longer exists")
            .field("tenants", 2)
            .close(Tone::Ok, "Removed 1 item(s)");

        assert_eq!(
            report.plain_lines(),
            vec![
                "Garbage collection",
                "",
                "  [OK] Removed shared binaries (1.0)",
                "  [WARN] dk-a no longer exists",
                "  tenants: 2",
                "",
                "[OK] Removed 1 item(s)",
            ]
        );
    }

    #[test]
    fn bare_report_has_no_banner() {
        let mut report = Report::bare();
        report.step(Tone::Info, "Volume vol-1 was not recorded");

        assert_eq!(report.title(), None);
        assert_eq!(report.closing(), None);
        assert_eq!(
            report.plain_lines(),
            vec!["  [INFO] Volume vol-1 was not recorded"]
        );
    }

    #[test]
    fn headings_separate_groups() {
        let mut report = Report::bare();
        report.heading("Volumes without pod").item("volume|pod vol-1|pod-1");

        assert_eq!(
            report.plain_lines(),
            vec!["", "Volumes without pod", "  volume|pod vol-1|pod-1"]
        );
    }
}
