//! HL7 v2 segment tokenising.
//!
//! Field numbering follows the HL7 convention. For `MSH` the field separator itself is MSH-1,
//! so `MSH|^~\&|APP` has MSH-2 = `^~\&` and MSH-3 = `APP`. For every other segment field 1 is
//! the first value after the segment name.

/// Encoding characters declared in MSH-2.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncodingCharacters {
    pub field: char,
    pub component: char,
    pub repetition: char,
    pub escape: char,
    pub subcomponent: char,
}

impl Default for EncodingCharacters {
    fn default() -> Self {
        Self {
            field: '|',
            component: '^',
            repetition: '~',
            escape: '\\',
            subcomponent: '&',
        }
    }
}

impl EncodingCharacters {
    /// Read the encoding characters from an `MSH` line, or `None` if it is not one.
    pub fn from_msh(line: &str) -> Option<Self> {
        let rest = line.trim_start().strip_prefix("MSH")?;
        let mut chars = rest.chars();
        let field = chars.next()?;
        let mut declared = chars.take_while(|c| *c != field);
        let defaults = Self::default();
        Some(Self {
            field,
            component: declared.next().unwrap_or(defaults.component),
            repetition: declared.next().unwrap_or(defaults.repetition),
            escape: declared.next().unwrap_or(defaults.escape),
            subcomponent: declared.next().unwrap_or(defaults.subcomponent),
        })
    }

    /// Escape delimiter characters in a value destined for a generated message.
    pub fn escape(&self, value: &str) -> String {
        let mut out = String::with_capacity(value.len());
        for c in value.chars() {
            if c == self.escape {
                out.push_str(&format!("{0}E{0}", self.escape));
            } else if c == self.field {
                out.push_str(&format!("{0}F{0}", self.escape));
            } else if c == self.component {
                out.push_str(&format!("{0}S{0}", self.escape));
            } else if c == self.repetition {
                out.push_str(&format!("{0}R{0}", self.escape));
            } else if c == self.subcomponent {
                out.push_str(&format!("{0}T{0}", self.escape));
            } else if c == '\r' || c == '\n' {
                out.push(' ');
            } else {
                out.push(c);
            }
        }
        out
    }
}

/// Normalise CR, LF and CRLF terminators and return the non-blank segment lines.
pub fn to_segment_lines(message: &str) -> Vec<String> {
    message
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// A tokenised segment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    name: String,
    tokens: Vec<String>,
    encoding: EncodingCharacters,
}

impl Segment {
    pub fn parse(line: &str, encoding: &EncodingCharacters) -> Self {
        let tokens: Vec<String> = line.split(encoding.field).map(str::to_string).collect();
        let name = tokens.first().map(|t| t.trim().to_string()).unwrap_or_default();
        Self {
            name,
            tokens,
            encoding: *encoding,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// HL7 field `number`, trimmed, or `None` if absent or blank.
    pub fn field(&self, number: usize) -> Option<&str> {
        let index = if self.name == "MSH" {
            number.checked_sub(1)?
        } else {
            number
        };
        if index == 0 {
            return None;
        }
        self.tokens
            .get(index)
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
    }

    /// Component `component` (1-based) of field `number`, trimmed, or `None` if blank.
    pub fn component(&self, number: usize, component: usize) -> Option<&str> {
        let field = self.field(number)?;
        field
            .split(self.encoding.component)
            .nth(component.checked_sub(1)?)
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }
}

/// Tokenise every line of `message`, using the encoding declared by its MSH segment.
pub fn parse_segments(message: &str) -> Vec<Segment> {
    let lines = to_segment_lines(message);
    let encoding = lines
        .iter()
        .find_map(|line| EncodingCharacters::from_msh(line))
        .unwrap_or_default();
    lines
        .iter()
        .map(|line| Segment::parse(line, &encoding))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_segment_lines_normalises_terminators() {
        let lines = to_segment_lines("MSH|^~\\&|A\r\nPID|1\rOBR|1\n\nOBX|1");
        assert_eq!(lines, vec!["MSH|^~\\&|A", "PID|1", "OBR|1", "OBX|1"]);
    }

    #[test]
    fn test_msh_field_numbering() {
        let enc = EncodingCharacters::from_msh("MSH|^~\\&|ANALYZER|LAB").unwrap();
        let msh = Segment::parse("MSH|^~\\&|ANALYZER|LAB", &enc);
        assert_eq!(msh.field(2), Some("^~\\&"));
        assert_eq!(msh.field(3), Some("ANALYZER"));
        assert_eq!(msh.field(4), Some("LAB"));
        assert_eq!(msh.field(1), None);
    }

    #[test]
    fn test_other_segment_field_numbering() {
        let pid = Segment::parse("PID|1||PAT123^^^MRN||Doe^Jane", &EncodingCharacters::default());
        assert_eq!(pid.field(1), Some("1"));
        assert_eq!(pid.field(3), Some("PAT123^^^MRN"));
        assert_eq!(pid.component(3, 1), Some("PAT123"));
        assert_eq!(pid.component(5, 2), Some("Jane"));
        assert_eq!(pid.component(5, 3), None);
    }

    #[test]
    fn test_from_msh_custom_component_separator() {
        let enc = EncodingCharacters::from_msh("MSH#*~\\&#APP").unwrap();
        assert_eq!(enc.field, '#');
        assert_eq!(enc.component, '*');
    }

    #[test]
    fn test_escape_delimiters() {
        let enc = EncodingCharacters::default();
        assert_eq!(enc.escape("A|B^C"), "A\\F\\B\\S\\C");
        assert_eq!(enc.escape("plain"), "plain");
    }
}
