//! Message template rendering.
//!
//! `{Field}` tokens are replaced by the recipient's value for `Field`.
//! Tokens naming no field stay as written. Inserted values are not scanned
//! again, so a value that itself looks like `{Other}` is left alone.

use crate::recipients::RecipientRecord;

/// A message body template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTemplate {
    source: String,
}

impl MessageTemplate {
    /// Wraps template text.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// Returns the template text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Returns the field names referenced by `{...}` tokens, in order.
    pub fn placeholders(&self) -> Vec<&str> {
        let mut names = Vec::new();
        let mut rest = self.source.as_str();
        while let Some(open) = rest.find('{') {
            let after = &rest[open + 1..];
            match after.find(['{', '}']) {
                Some(close) if after.as_bytes()[close] == b'}' => {
                    names.push(&after[..close]);
                    rest = &after[close + 1..];
                }
                Some(close) => rest = &after[close..],
                None => break,
            }
        }
        names
    }

    /// Renders the template for one recipient.
    pub fn render(&self, record: &RecipientRecord) -> String {
        let mut output = String::with_capacity(self.source.len());
        let mut rest = self.source.as_str();

        while let Some(open) = rest.find('{') {
            output.push_str(&rest[..open]);
            let after = &rest[open + 1..];

            match after.find(['{', '}']) {
                Some(close) if after.as_bytes()[close] == b'}' => {
                    let name = &after[..close];
                    match record.get(name) {
                        Some(value) => output.push_str(value),
                        None => {
                            output.push('{');
                            output.push_str(name);
                            output.push('}');
                        }
                    }
                    rest = &after[close + 1..];
                }
                // `{` without a matching `}` before the next `{`
                Some(close) => {
                    output.push('{');
                    output.push_str(&after[..close]);
                    rest = &after[close..];
                }
                None => {
                    output.push('{');
                    output.push_str(after);
                    rest = "";
                }
            }
        }

        output.push_str(rest);
        output
    }

    /// Returns the referenced fields that the columns do not provide.
    pub fn unknown_placeholders<'a>(&'a self, columns: &[String]) -> Vec<&'a str> {
        self.placeholders()
            .into_iter()
            .filter(|name| !columns.iter().any(|c| c == name))
            .collect()
    }
}

impl From<&str> for MessageTemplate {
    fn from(source: &str) -> Self {
        Self::new(source)
    }
}

impl From<String> for MessageTemplate {
    fn from(source: String) -> Self {
        Self::new(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn record() -> RecipientRecord {
        RecipientRecord::new([
            ("Company Name", "Acme"),
            ("Email", "a@b.com"),
            ("Contact Person", "Ann"),
        ])
    }

    #[test]
    fn test_render_known_fields() {
        let template = MessageTemplate::new("Dear {Contact Person},\nNews for {Company Name}.");
        assert_eq!(template.render(&record()), "Dear Ann,\nNews for Acme.");
    }

    #[test]
    fn test_render_email_placeholder() {
        let rendered = MessageTemplate::new("Write to {Email} today").render(&record());
        assert!(rendered.contains("a@b.com"));
        assert!(!rendered.contains("{Email}"));
    }

    #[rstest]
    #[case("No placeholders at all")]
    #[case("Unknown {Location} stays")]
    #[case("Braces { without } a field")]
    #[case("Dangling {open")]
    #[case("Nested {{Other}}")]
    #[case("")]
    fn test_render_without_matching_fields_is_identity(#[case] source: &str) {
        assert_eq!(MessageTemplate::new(source).render(&record()), source);
    }

    #[test]
    fn test_inserted_values_are_not_expanded() {
        let record = RecipientRecord::new([("Company Name", "{Email}"), ("Email", "a@b.com")]);
        assert_eq!(
            MessageTemplate::new("{Company Name}").render(&record),
            "{Email}"
        );
    }

    #[test]
    fn test_placeholders() {
        let template = MessageTemplate::new("Hi {Contact Person} at {Company Name} in {Location}");
        assert_eq!(
            template.placeholders(),
            vec!["Contact Person", "Company Name", "Location"]
        );

        let columns = vec!["Company Name".to_string(), "Contact Person".to_string()];
        assert_eq!(template.unknown_placeholders(&columns), vec!["Location"]);
    }
}
