//! Log-message templates for tracepoints. A message is plain text with
//! embedded `{expression}` segments; `\{`, `\}` and `\\` escape literally.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTracepoint {
    pub position: usize,
    pub reason: &'static str,
}

impl fmt::Display for InvalidTracepoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid log message at offset {}: {}",
            self.position, self.reason
        )
    }
}

impl std::error::Error for InvalidTracepoint {}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Expression(String),
}

/// A parsed tracepoint log message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tracepoint {
    segments: Vec<Segment>,
}

impl Tracepoint {
    pub fn parse(message: &str) -> Result<Self, InvalidTracepoint> {
        let mut segments = Vec::new();
        let mut text = String::new();
        let mut chars = message.char_indices().peekable();

        while let Some((pos, ch)) = chars.next() {
            match ch {
                '\\' => match chars.next() {
                    Some((_, escaped @ ('{' | '}' | '\\'))) => text.push(escaped),
                    Some((_, other)) => {
                        text.push('\\');
                        text.push(other);
                    }
                    None => text.push('\\'),
                },
                '{' => {
                    let mut expression = String::new();
                    let mut closed = false;
                    for (_, ch) in chars.by_ref() {
                        if ch == '}' {
                            closed = true;
                            break;
                        }
                        expression.push(ch);
                    }
                    if !closed {
                        return Err(InvalidTracepoint {
                            position: pos,
                            reason: "unterminated '{'",
                        });
                    }
                    if expression.trim().is_empty() {
                        return Err(InvalidTracepoint {
                            position: pos,
                            reason: "empty expression",
                        });
                    }
                    if !text.is_empty() {
                        segments.push(Segment::Text(std::mem::take(&mut text)));
                    }
                    segments.push(Segment::Expression(expression.trim().to_string()));
                }
                '}' => {
                    return Err(InvalidTracepoint {
                        position: pos,
                        reason: "unmatched '}'",
                    });
                }
                _ => text.push(ch),
            }
        }

        if !text.is_empty() {
            segments.push(Segment::Text(text));
        }

        Ok(Tracepoint { segments })
    }

    /// Render the message, resolving each embedded expression through
    /// `eval`. Failed evaluations render as `<error: ...>` instead of
    /// aborting the whole message.
    pub fn format(&self, mut eval: impl FnMut(&str) -> Result<String, String>) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Expression(expression) => match eval(expression) {
                    Ok(value) => out.push_str(&value),
                    Err(error) => {
                        out.push_str("<error: ");
                        out.push_str(&error);
                        out.push('>');
                    }
                },
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_passes_through() {
        let tp = Tracepoint::parse("hit the spot").unwrap();
        assert_eq!(tp.format(|_| unreachable!()), "hit the spot");
    }

    #[test]
    fn expressions_are_substituted_in_order() {
        let tp = Tracepoint::parse("x={x}, y={ y }").unwrap();
        let rendered = tp.format(|expr| Ok(format!("<{expr}>")));
        assert_eq!(rendered, "x=<x>, y=<y>");
    }

    #[test]
    fn escapes_produce_literal_braces() {
        let tp = Tracepoint::parse(r"literal \{brace\} and backslash \\").unwrap();
        assert_eq!(
            tp.format(|_| unreachable!()),
            r"literal {brace} and backslash \"
        );
    }

    #[test]
    fn failed_evaluation_is_inlined() {
        let tp = Tracepoint::parse("value: {broken}").unwrap();
        let rendered = tp.format(|_| Err("no such variable".to_string()));
        assert_eq!(rendered, "value: <error: no such variable>");
    }

    #[test]
    fn unterminated_and_empty_expressions_are_rejected() {
        assert!(Tracepoint::parse("oops {x").is_err());
        assert!(Tracepoint::parse("oops {}").is_err());
        assert!(Tracepoint::parse("oops }").is_err());
    }
}
