//! Splitting write payloads into candidate account records.
//!
//! A payload is cut at every line delimiter. Each segment that contains the
//! field separator is a [`CandidateRecord`], split at the *first* separator
//! into an identity field and a remainder. Segments without a separator are
//! skipped.
//!
//! A write is not required to start or end on a record boundary, so the
//! final segment is yielded whether or not a delimiter follows it. A record
//! counts because it carries a separator, not because it is terminated:
//! dropping the trailing newline must not hide a record.
//!
//! Content is never trimmed or rewritten; identities are byte-exact slices
//! of the payload.

use serde::{Deserialize, Serialize};

/// Delimiters used to recognise records in a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFormat {
    /// Byte ending a record
    #[serde(with = "ascii_char", default = "default_line_delimiter")]
    pub line_delimiter: u8,
    /// Byte ending the identity field
    #[serde(with = "ascii_char", default = "default_field_separator")]
    pub field_separator: u8,
}

fn default_line_delimiter() -> u8 {
    b'\n'
}

fn default_field_separator() -> u8 {
    b':'
}

impl Default for RecordFormat {
    fn default() -> Self {
        Self {
            line_delimiter: default_line_delimiter(),
            field_separator: default_field_separator(),
        }
    }
}

impl RecordFormat {
    /// Parse `buffer` with this format.
    pub fn parse<'a>(&self, buffer: &'a [u8]) -> Records<'a> {
        Records {
            rest: Some(buffer),
            format: *self,
        }
    }
}

/// Helper for serializing a delimiter byte as a one-character string
mod ascii_char {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(byte: &u8, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_char(char::from(*byte))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u8, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let mut chars = s.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) if c.is_ascii() => Ok(c as u8),
            _ => Err(D::Error::custom(format!(
                "expected a single ASCII character, got {s:?}"
            ))),
        }
    }
}

/// A payload segment that looks like an account record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateRecord<'a> {
    /// Bytes before the first field separator. May be empty.
    pub identity: &'a [u8],
    /// Bytes after the first field separator.
    pub remainder: &'a [u8],
    /// Whether a line delimiter followed this record in the payload.
    pub terminated: bool,
}

impl<'a> CandidateRecord<'a> {
    fn split(segment: &'a [u8], separator: u8, terminated: bool) -> Option<Self> {
        let at = segment.iter().position(|&b| b == separator)?;
        Some(Self {
            identity: &segment[..at],
            remainder: &segment[at + 1..],
            terminated,
        })
    }

    /// The identity field decoded for display. Invalid UTF-8 is replaced.
    pub fn identity_lossy(&self) -> String {
        String::from_utf8_lossy(self.identity).into_owned()
    }
}

/// Lazy iterator over the candidate records of one payload.
///
/// Cloning forks the iteration at its current position. Call
/// [`RecordFormat::parse`] again to start over.
#[derive(Debug, Clone)]
pub struct Records<'a> {
    rest: Option<&'a [u8]>,
    format: RecordFormat,
}

impl<'a> Iterator for Records<'a> {
    type Item = CandidateRecord<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let buf = self.rest?;
            let (segment, terminated) =
                match buf.iter().position(|&b| b == self.format.line_delimiter) {
                    Some(end) => {
                        self.rest = Some(&buf[end + 1..]);
                        (&buf[..end], true)
                    }
                    None => {
                        self.rest = None;
                        (buf, false)
                    }
                };
            if let Some(record) =
                CandidateRecord::split(segment, self.format.field_separator, terminated)
            {
                return Some(record);
            }
        }
    }
}

impl std::iter::FusedIterator for Records<'_> {}

/// Parse `buffer` into candidate records using the default `name:...` format.
pub fn parse(buffer: &[u8]) -> Records<'_> {
    RecordFormat::default().parse(buffer)
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn identities(buffer: &[u8]) -> Vec<&[u8]> {
        parse(buffer).map(|r| r.identity).collect()
    }

    #[test]
    fn test_single_record() {
        let records: Vec<_> =
            parse(b"operator:x:1000:1000::/home/operator:/bin/bash\n").collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].identity, b"operator");
        assert_eq!(records[0].remainder, b"x:1000:1000::/home/operator:/bin/bash");
        assert!(records[0].terminated);
    }

    #[test]
    fn test_empty_and_blank_payloads() {
        assert!(identities(b"").is_empty());
        assert!(identities(b"\n").is_empty());
        assert!(identities(b"   \n\t\n").is_empty());
    }

    #[test]
    fn test_segments_without_separator_are_skipped() {
        assert!(identities(b"not-a-record-just-text\n").is_empty());
        assert_eq!(
            identities(b"junk\nmallory:x:1001\nmore junk"),
            vec![b"mallory".as_slice()]
        );
    }

    #[test]
    fn test_unterminated_final_record_is_yielded() {
        let records: Vec<_> =
            parse(b"operator:x\nmallory:x:1001:1001::/home/mallory:/bin/sh").collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].identity, b"mallory");
        assert!(!records[1].terminated);
    }

    #[test]
    fn test_leading_fragment_without_separator() {
        // Tail of a record written by an earlier call.
        assert_eq!(
            identities(b"/bin/bash\noperator:x:1000\n"),
            vec![b"operator".as_slice()]
        );
    }

    #[test]
    fn test_splits_at_first_separator_only() {
        let record = parse(b"a:b:c").next().unwrap();
        assert_eq!(record.identity, b"a");
        assert_eq!(record.remainder, b"b:c");
    }

    #[test]
    fn test_empty_identity_is_still_a_record() {
        let record = parse(b":x:0:0::/root:/bin/sh\n").next().unwrap();
        assert!(record.identity.is_empty());
    }

    #[test]
    fn test_bytes_are_preserved_exactly() {
        assert_eq!(
            identities(b" operator :x\r\noperator\t:x\n"),
            vec![b" operator ".as_slice(), b"operator\t".as_slice()]
        );
    }

    #[test]
    fn test_nul_does_not_end_parsing() {
        assert_eq!(
            identities(b"operator:x\n\0\nmallory:x\n"),
            vec![b"operator".as_slice(), b"mallory".as_slice()]
        );
        assert_eq!(identities(b"\0mallory:x"), vec![b"\0mallory".as_slice()]);
    }

    #[test]
    fn test_custom_format() {
        let format = RecordFormat {
            line_delimiter: b';',
            field_separator: b'=',
        };
        let ids: Vec<_> = format
            .parse(b"operator=1;mallory=2;plain")
            .map(|r| r.identity_lossy())
            .collect();
        assert_eq!(ids, vec!["operator", "mallory"]);
    }

    #[test]
    fn test_reparse_yields_same_records() {
        let payload = b"operator:x\nmallory:x";
        let first: Vec<_> = parse(payload).collect();
        let second: Vec<_> = parse(payload).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_format_serialization() {
        let json = serde_json::to_string(&RecordFormat::default()).unwrap();
        assert_eq!(json, r#"{"line_delimiter":"\n","field_separator":":"}"#);

        let format: RecordFormat = serde_json::from_str(r#"{"field_separator":"|"}"#).unwrap();
        assert_eq!(format.line_delimiter, b'\n');
        assert_eq!(format.field_separator, b'|');

        assert!(serde_json::from_str::<RecordFormat>(r#"{"field_separator":"::"}"#).is_err());
        assert!(serde_json::from_str::<RecordFormat>(r#"{"field_separator":"é"}"#).is_err());
    }
}
