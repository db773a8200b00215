//! SMTP reply parsing.

use crate::error::{ClientError, Result};

/// One parsed line of a (possibly multi-line) SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ReplyLine {
    code: u16,
    is_last: bool,
    text: String,
}

/// A complete SMTP reply, which may span multiple lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// The SMTP status code.
    pub code: u16,
    /// All text lines in the reply.
    pub lines: Vec<String>,
}

impl Response {
    /// Creates a new `Response`.
    #[must_use]
    pub const fn new(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    /// The reply text, lines joined by newlines.
    #[must_use]
    pub fn message(&self) -> String {
        self.lines.join("\n")
    }

    /// `true` for 2xx replies.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    /// `true` for 4xx replies.
    #[must_use]
    pub const fn is_temporary_error(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    /// `true` for 5xx replies.
    #[must_use]
    pub const fn is_permanent_error(&self) -> bool {
        self.code >= 500 && self.code < 600
    }

    /// `true` if the EHLO reply advertises the given extension keyword.
    #[must_use]
    pub fn advertises(&self, extension: &str) -> bool {
        self.lines
            .iter()
            .any(|line| line.to_ascii_uppercase().starts_with(&extension.to_ascii_uppercase()))
    }

    fn parse_line(line: &str) -> Result<ReplyLine> {
        if line.len() < 3 {
            return Err(ClientError::ParseError(format!(
                "Reply line too short: '{line}'"
            )));
        }

        let code = line[..3]
            .parse::<u16>()
            .map_err(|_| ClientError::ParseError(format!("Invalid status code: '{line}'")))?;

        let is_last = match line.as_bytes().get(3) {
            Some(b' ') | None => true,
            Some(b'-') => false,
            Some(c) => {
                return Err(ClientError::ParseError(format!(
                    "Invalid separator character: '{}'",
                    char::from(*c)
                )));
            }
        };

        let text = line.get(4..).unwrap_or_default().to_string();

        Ok(ReplyLine {
            code,
            is_last,
            text,
        })
    }

    /// Parses a complete multi-line reply from a buffer.
    ///
    /// Returns the parsed `Response` and the number of bytes consumed, or
    /// `None` if the buffer does not yet hold a complete reply.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::ParseError` if the reply is malformed.
    pub fn parse(buffer: &[u8]) -> Result<Option<(Self, usize)>> {
        let text = std::str::from_utf8(buffer)?;
        let mut lines = Vec::new();
        let mut consumed = 0;
        let mut code = None;

        loop {
            let rest = &text[consumed..];
            let Some(end) = rest.find('\n') else {
                return Ok(None); // Incomplete line, need more data
            };
            let raw = rest[..end].trim_end_matches('\r');
            consumed += end + 1;

            if raw.is_empty() {
                continue;
            }

            let line = Self::parse_line(raw)?;

            match code {
                None => code = Some(line.code),
                Some(expected) if line.code != expected => {
                    return Err(ClientError::ParseError(format!(
                        "Status code mismatch in multi-line reply: expected {expected}, got {}",
                        line.code
                    )));
                }
                Some(_) => {}
            }

            lines.push(line.text);

            if line.is_last {
                let Some(code) = code else {
                    return Ok(None);
                };
                return Ok(Some((Self::new(code, lines), consumed)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_line() {
        let (response, consumed) = Response::parse(b"250 OK\r\n").unwrap().unwrap();
        assert_eq!(response.code, 250);
        assert_eq!(response.lines, vec!["OK"]);
        assert_eq!(consumed, 8);
        assert!(response.is_success());
    }

    #[test]
    fn parse_multi_line() {
        let data = b"250-mail.example.com\r\n250-SIZE 10000000\r\n250 STARTTLS\r\n";
        let (response, consumed) = Response::parse(data).unwrap().unwrap();
        assert_eq!(response.code, 250);
        assert_eq!(
            response.lines,
            vec!["mail.example.com", "SIZE 10000000", "STARTTLS"]
        );
        assert_eq!(consumed, data.len());
        assert!(response.advertises("STARTTLS"));
        assert!(!response.advertises("PIPELINING"));
    }

    #[test]
    fn incomplete_reply_needs_more_data() {
        assert!(Response::parse(b"250-mail.example.com\r\n250-SIZE")
            .unwrap()
            .is_none());
        assert!(Response::parse(b"25").unwrap().is_none());
    }

    #[test]
    fn mismatched_codes_are_rejected() {
        let result = Response::parse(b"250-first\r\n550 second\r\n");
        assert!(result.is_err());
    }

    #[test]
    fn error_classes() {
        assert!(Response::new(452, vec![]).is_temporary_error());
        assert!(Response::new(550, vec![]).is_permanent_error());
        assert!(!Response::new(250, vec![]).is_temporary_error());
    }

    #[test]
    fn bare_lf_line_endings_are_accepted() {
        let (response, _) = Response::parse(b"220 ready\n").unwrap().unwrap();
        assert_eq!(response.code, 220);
        assert_eq!(response.lines, vec!["ready"]);
    }
}
