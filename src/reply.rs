use crate::error::ContextError;

/// SMTP reply code, optional enhanced status code and message sent in place
/// of a bare reject or temporary failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyCode {
    code: u16,
    extended: Option<String>,
    message: Option<String>,
}

fn is_short_number(part: &str) -> bool {
    (1..=3).contains(&part.len()) && part.bytes().all(|b| b.is_ascii_digit())
}

fn validate_extended(code: u16, extended: &str) -> Result<(), ContextError> {
    let parts: Vec<&str> = extended.split('.').collect();
    let [class, subject, detail] = parts.as_slice() else {
        return Err(ContextError::InvalidCode(format!(
            "extended code must be class.subject.detail: <{extended}>"
        )));
    };
    if !matches!(*class, "2" | "4" | "5") {
        return Err(ContextError::InvalidCode(format!(
            "extended code class must be 2, 4 or 5: <{extended}>"
        )));
    }
    if !is_short_number(subject) || !is_short_number(detail) {
        return Err(ContextError::InvalidCode(format!(
            "extended code subject and detail must be 1 to 3 digits: <{extended}>"
        )));
    }
    if class.parse::<u16>().ok() != Some(code / 100) {
        return Err(ContextError::InvalidCode(format!(
            "extended code <{extended}> does not match reply code <{code}>"
        )));
    }
    Ok(())
}

impl ReplyCode {
    pub fn new(code: u16, extended: Option<&str>, message: Option<&str>) -> Result<Self, ContextError> {
        if !(400..600).contains(&code) {
            return Err(ContextError::InvalidCode(format!(
                "reply code must be 4XX or 5XX: <{code}>"
            )));
        }
        let extended = extended.filter(|e| !e.is_empty());
        if let Some(extended) = extended {
            validate_extended(code, extended)?;
        }
        Ok(ReplyCode {
            code,
            extended: extended.map(str::to_string),
            message: message.filter(|m| !m.is_empty()).map(str::to_string),
        })
    }

    /// Parses the text of a reply-code packet such as
    /// `"554 5.7.1 rejected\r\n554 5.7.1 by policy"`.
    pub fn parse(text: &str) -> Result<Self, ContextError> {
        let mut code = None;
        let mut extended = None;
        let mut lines = Vec::new();
        for line in text.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.len() < 3 || !line.is_char_boundary(3) {
                return Err(ContextError::InvalidCode(format!("truncated reply: <{text}>")));
            }
            let (digits, rest) = line.split_at(3);
            let value = digits
                .parse::<u16>()
                .map_err(|_| ContextError::InvalidCode(format!("no reply code in <{line}>")))?;
            if *code.get_or_insert(value) != value {
                return Err(ContextError::InvalidCode(format!(
                    "mixed reply codes in <{text}>"
                )));
            }
            let rest = rest.trim_start_matches(['-', ' ']);
            let (first, remainder) = rest.split_once(' ').unwrap_or((rest, ""));
            let rest = if first.contains('.') && first.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
                extended.get_or_insert_with(|| first.to_string());
                remainder
            } else {
                rest
            };
            lines.push(rest.to_string());
        }
        let code = code.ok_or_else(|| ContextError::InvalidCode("empty reply".into()))?;
        let message = lines.join("\n");
        ReplyCode::new(code, extended.as_deref(), Some(message.as_str()))
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn extended(&self) -> Option<&str> {
        self.extended.as_deref()
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn is_temporary(&self) -> bool {
        self.code / 100 == 4
    }

    /// Wire text: one `DDD[ X.Y.Z][ line]` per message line, CRLF separated.
    pub fn format(&self) -> String {
        let lines: Vec<&str> = match &self.message {
            Some(message) => message.split('\n').collect(),
            None => vec![""],
        };
        lines
            .into_iter()
            .map(|line| {
                let line = line.strip_suffix('\r').unwrap_or(line);
                let mut formatted = self.code.to_string();
                if let Some(extended) = &self.extended {
                    formatted.push(' ');
                    formatted.push_str(extended);
                }
                if !line.is_empty() {
                    formatted.push(' ');
                    formatted.push_str(line);
                }
                formatted
            })
            .collect::<Vec<_>>()
            .join("\r\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_mismatch_is_invalid() {
        let err = ReplyCode::new(450, Some("5.1.1"), Some("msg")).unwrap_err();
        assert!(matches!(err, ContextError::InvalidCode(_)));
    }

    #[test]
    fn test_matching_class_formats() {
        let reply = ReplyCode::new(450, Some("4.1.1"), Some("msg")).unwrap();
        assert_eq!(reply.format(), "450 4.1.1 msg");
        assert!(reply.is_temporary());
    }

    #[test]
    fn test_code_range() {
        assert!(ReplyCode::new(250, None, None).is_err());
        assert!(ReplyCode::new(600, None, None).is_err());
        assert_eq!(ReplyCode::new(554, None, None).unwrap().format(), "554");
    }

    #[test]
    fn test_extended_code_shape() {
        assert!(ReplyCode::new(550, Some("5.1"), None).is_err());
        assert!(ReplyCode::new(550, Some("5.1234.1"), None).is_err());
        assert!(ReplyCode::new(550, Some("3.1.1"), None).is_err());
        assert!(ReplyCode::new(550, Some("5.x.1"), None).is_err());
        assert!(ReplyCode::new(550, Some("5.7.26"), None).is_ok());
    }

    #[test]
    fn test_multi_line_message() {
        let reply = ReplyCode::new(550, Some("5.7.1"), Some("first\r\nsecond")).unwrap();
        assert_eq!(reply.format(), "550 5.7.1 first\r\n550 5.7.1 second");
    }

    #[test]
    fn test_parse_round_trips_format() {
        let reply = ReplyCode::new(451, Some("4.7.1"), Some("try\nlater")).unwrap();
        let parsed = ReplyCode::parse(&reply.format()).unwrap();
        assert_eq!(parsed, reply);

        let bare = ReplyCode::parse("554 go away").unwrap();
        assert_eq!(bare.extended(), None);
        assert_eq!(bare.message(), Some("go away"));

        let dashed = ReplyCode::parse("550-5.7.1 first\r\n550 5.7.1 last").unwrap();
        assert_eq!(dashed.message(), Some("first\nlast"));
        assert_eq!(dashed.extended(), Some("5.7.1"));

        assert!(ReplyCode::parse("hi").is_err());
        assert!(ReplyCode::parse("550 a\r\n450 b").is_err());
    }
}
