//! Decoding of raw lines into validated points.
//!
//! The [`WavefrontDecoder`] understands two line formats. Samples are written as
//!
//! ```text
//! <metric> <value> [<timestamp>] [source=<source>] [<tag>=<value> ...]
//! ```
//!
//! and pre-aggregated distributions as
//!
//! ```text
//! !M [<timestamp>] #<count> <mean> [#<count> <mean> ...] <metric> [source=<source>] [<tag>=<value> ...]
//! ```
//!
//! where `!M`, `!H`, and `!D` select minute, hour, and day bins. Names and tag values may be
//! enclosed in double quotes to contain spaces. Timestamps are accepted in seconds, milliseconds,
//! microseconds, or nanoseconds since the epoch and normalized to milliseconds.

use std::collections::BTreeMap;
use std::fmt;

use crate::digest::Centroid;
use crate::granularity::Granularity;

/// Tag keys that carry the source of a point rather than a regular tag.
const SOURCE_TAGS: &[&str] = &["source", "host"];

/// Timestamps beyond these magnitudes are interpreted in finer units.
const MAX_SECONDS: f64 = 1e11;
const MAX_MILLIS: f64 = 1e14;
const MAX_MICROS: f64 = 1e17;

/// A point decoded from a single line.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedPoint {
    /// The metric name.
    pub metric: String,
    /// The source that reported the point.
    pub source: String,
    /// Point tags, excluding the source.
    pub tags: BTreeMap<String, String>,
    /// Timestamp in milliseconds since the epoch, if the line contained one.
    pub timestamp_ms: Option<i64>,
    /// The reported value.
    pub value: PointValue,
}

/// The value of a [`DecodedPoint`].
#[derive(Clone, Debug, PartialEq)]
pub enum PointValue {
    /// A single sample.
    Sample(f64),
    /// A pre-aggregated distribution.
    Distribution {
        /// The bin width the sender aggregated into.
        granularity: Granularity,
        /// The `(mean, count)` pairs of the distribution.
        centroids: Vec<Centroid>,
    },
}

/// A reason a line was rejected.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The line contains nothing but whitespace.
    #[error("empty line")]
    Empty,
    /// A quoted string is not closed.
    #[error("unterminated quote")]
    UnterminatedQuote,
    /// The metric name is missing.
    #[error("missing metric name")]
    MissingMetric,
    /// The value is missing.
    #[error("missing value")]
    MissingValue,
    /// The value is not a number.
    #[error("invalid value {0:?}")]
    InvalidValue(String),
    /// The value is NaN or infinite.
    #[error("value is not finite")]
    NonFinite,
    /// The timestamp is not a number.
    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),
    /// A tag is not of the form `key=value`.
    #[error("invalid tag {0:?}")]
    InvalidTag(String),
    /// A distribution count is not a non-negative integer.
    #[error("invalid count {0:?}")]
    InvalidCount(String),
    /// The counts of a distribution add up to more than a digest can hold.
    #[error("total count of distribution overflows")]
    CountOverflow,
    /// A distribution has a different number of counts than means.
    #[error("number of counts does not match number of means")]
    MismatchedCentroids,
    /// A distribution has no centroids.
    #[error("empty distribution")]
    EmptyDistribution,
    /// The distribution prefix is not one of `!M`, `!H`, or `!D`.
    #[error("unknown distribution granularity {0:?}")]
    InvalidGranularity(String),
}

impl DecodeError {
    /// A short, stable identifier of the error for metric tags.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::UnterminatedQuote => "unterminated_quote",
            Self::MissingMetric => "missing_metric",
            Self::MissingValue => "missing_value",
            Self::InvalidValue(_) => "invalid_value",
            Self::NonFinite => "non_finite",
            Self::InvalidTimestamp(_) => "invalid_timestamp",
            Self::InvalidTag(_) => "invalid_tag",
            Self::InvalidCount(_) => "invalid_count",
            Self::CountOverflow => "count_overflow",
            Self::MismatchedCentroids => "mismatched_centroids",
            Self::EmptyDistribution => "empty_distribution",
            Self::InvalidGranularity(_) => "invalid_granularity",
        }
    }
}

/// Decodes raw lines into points.
pub trait PointDecoder: fmt::Debug + Send + Sync {
    /// Decodes and validates a single line.
    fn decode(&self, line: &str) -> Result<DecodedPoint, DecodeError>;
}

/// Decoder for the Wavefront line format, see the [module documentation](self).
#[derive(Clone, Debug)]
pub struct WavefrontDecoder {
    default_source: String,
}

impl WavefrontDecoder {
    /// Creates a decoder that assigns `default_source` to points without a source.
    pub fn new(default_source: impl Into<String>) -> Self {
        Self {
            default_source: default_source.into(),
        }
    }

    fn decode_sample(&self, tokens: &[Token<'_>]) -> Result<DecodedPoint, DecodeError> {
        let (metric, rest) = tokens.split_first().ok_or(DecodeError::MissingMetric)?;
        let (value, rest) = rest.split_first().ok_or(DecodeError::MissingValue)?;

        let value = parse_value(value.text())?;
        let (timestamp_ms, rest) = split_timestamp(rest)?;
        let (source, tags) = self.parse_tags(rest)?;

        Ok(DecodedPoint {
            metric: metric.text().to_owned(),
            source,
            tags,
            timestamp_ms,
            value: PointValue::Sample(value),
        })
    }

    fn decode_distribution(&self, tokens: &[Token<'_>]) -> Result<DecodedPoint, DecodeError> {
        let (prefix, rest) = tokens.split_first().ok_or(DecodeError::Empty)?;
        let granularity = match prefix.text() {
            "!M" => Granularity::Minute,
            "!H" => Granularity::Hour,
            "!D" => Granularity::Day,
            other => return Err(DecodeError::InvalidGranularity(other.to_owned())),
        };

        let (timestamp_ms, mut rest) = split_timestamp(rest)?;

        let mut centroids = Vec::new();
        let mut total = 0u64;
        while let Some((token, tail)) = rest.split_first() {
            let Some(count) = token.bare().and_then(|t| t.strip_prefix('#')) else {
                break;
            };
            let count = count
                .parse::<u64>()
                .map_err(|_| DecodeError::InvalidCount(count.to_owned()))?;
            total = total
                .checked_add(count)
                .ok_or(DecodeError::CountOverflow)?;

            let (mean, tail) = tail.split_first().ok_or(DecodeError::MismatchedCentroids)?;
            // A count followed by anything but a number has no mean.
            let mean = mean
                .bare()
                .and_then(|text| text.parse::<f64>().ok())
                .ok_or(DecodeError::MismatchedCentroids)?;
            if !mean.is_finite() {
                return Err(DecodeError::NonFinite);
            }

            centroids.push(Centroid::new(mean, count));
            rest = tail;
        }

        if centroids.is_empty() {
            return Err(DecodeError::EmptyDistribution);
        }

        let (metric, rest) = rest.split_first().ok_or(DecodeError::MissingMetric)?;
        let (source, tags) = self.parse_tags(rest)?;

        Ok(DecodedPoint {
            metric: metric.text().to_owned(),
            source,
            tags,
            timestamp_ms,
            value: PointValue::Distribution {
                granularity,
                centroids,
            },
        })
    }

    fn parse_tags(
        &self,
        tokens: &[Token<'_>],
    ) -> Result<(String, BTreeMap<String, String>), DecodeError> {
        let mut source = None;
        let mut tags = BTreeMap::new();

        for token in tokens {
            let (key, value) = token
                .tag()
                .ok_or_else(|| DecodeError::InvalidTag(token.text().to_owned()))?;
            if SOURCE_TAGS.contains(&key.as_str()) {
                source.get_or_insert(value);
            } else {
                tags.insert(key, value);
            }
        }

        let source = source.unwrap_or_else(|| self.default_source.clone());
        Ok((source, tags))
    }
}

impl PointDecoder for WavefrontDecoder {
    fn decode(&self, line: &str) -> Result<DecodedPoint, DecodeError> {
        let tokens = tokenize(line)?;
        match tokens.first() {
            None => Err(DecodeError::Empty),
            Some(first) if first.bare().is_some_and(|t| t.starts_with('!')) => {
                self.decode_distribution(&tokens)
            }
            Some(_) => self.decode_sample(&tokens),
        }
    }
}

/// A whitespace-separated part of a line.
#[derive(Debug, PartialEq)]
enum Token<'a> {
    /// Unquoted text.
    Bare(&'a str),
    /// A fully quoted string with escapes resolved.
    Quoted(String),
    /// A `key=value` pair where at least one side was quoted.
    QuotedTag(String, String),
}

impl Token<'_> {
    fn text(&self) -> &str {
        match self {
            Token::Bare(text) => text,
            Token::Quoted(text) => text,
            Token::QuotedTag(key, _) => key,
        }
    }

    fn bare(&self) -> Option<&str> {
        match self {
            Token::Bare(text) => Some(text),
            _ => None,
        }
    }

    fn tag(&self) -> Option<(String, String)> {
        match self {
            Token::Bare(text) => {
                let (key, value) = text.split_once('=')?;
                (!key.is_empty()).then(|| (key.to_owned(), value.to_owned()))
            }
            Token::QuotedTag(key, value) => Some((key.clone(), value.clone())),
            Token::Quoted(_) => None,
        }
    }
}

/// Splits a line into tokens, honoring double quotes.
fn tokenize(line: &str) -> Result<Vec<Token<'_>>, DecodeError> {
    let mut tokens = Vec::new();
    let mut rest = line.trim_start();

    while !rest.is_empty() {
        let end = rest
            .find(|c: char| c.is_whitespace() || c == '"')
            .unwrap_or(rest.len());

        if rest[end..].starts_with('"') {
            // `"quoted"` or `key="quoted"`
            let prefix = &rest[..end];
            let (quoted, tail) = read_quoted(&rest[end + 1..])?;
            let token = match prefix.strip_suffix('=') {
                Some(key) if !key.is_empty() => Token::QuotedTag(key.to_owned(), quoted),
                None if prefix.is_empty() => match tail.strip_prefix('=') {
                    // `"quoted key"=value`
                    Some(value_rest) => {
                        let (value, tail) = read_tag_value(value_rest)?;
                        rest = tail.trim_start();
                        tokens.push(Token::QuotedTag(quoted, value));
                        continue;
                    }
                    None => Token::Quoted(quoted),
                },
                _ => return Err(DecodeError::InvalidTag(prefix.to_owned())),
            };
            tokens.push(token);
            rest = tail.trim_start();
        } else {
            tokens.push(Token::Bare(&rest[..end]));
            rest = rest[end..].trim_start();
        }
    }

    Ok(tokens)
}

/// Reads a tag value that is either quoted or ends at the next whitespace.
fn read_tag_value(input: &str) -> Result<(String, &str), DecodeError> {
    match input.strip_prefix('"') {
        Some(quoted) => read_quoted(quoted),
        None => {
            let end = input.find(char::is_whitespace).unwrap_or(input.len());
            Ok((input[..end].to_owned(), &input[end..]))
        }
    }
}

/// Reads up to the closing quote, resolving backslash escapes.
///
/// `input` starts right after the opening quote.
fn read_quoted(input: &str) -> Result<(String, &str), DecodeError> {
    let mut value = String::new();
    let mut chars = input.char_indices();

    while let Some((index, c)) = chars.next() {
        match c {
            '"' => return Ok((value, &input[index + 1..])),
            '\\' => match chars.next() {
                Some((_, escaped)) => value.push(escaped),
                None => break,
            },
            c => value.push(c),
        }
    }

    Err(DecodeError::UnterminatedQuote)
}

fn parse_value(text: &str) -> Result<f64, DecodeError> {
    let value = text
        .parse::<f64>()
        .map_err(|_| DecodeError::InvalidValue(text.to_owned()))?;

    match value.is_finite() {
        true => Ok(value),
        false => Err(DecodeError::NonFinite),
    }
}

/// Splits off a leading timestamp, if the first token is numeric.
fn split_timestamp<'a, 'b>(
    tokens: &'a [Token<'b>],
) -> Result<(Option<i64>, &'a [Token<'b>]), DecodeError> {
    let Some((first, rest)) = tokens.split_first() else {
        return Ok((None, tokens));
    };

    match first.bare() {
        Some(text) if text.starts_with(|c: char| c.is_ascii_digit()) => {
            let raw = text
                .parse::<f64>()
                .map_err(|_| DecodeError::InvalidTimestamp(text.to_owned()))?;
            Ok((Some(normalize_timestamp(raw)), rest))
        }
        _ => Ok((None, tokens)),
    }
}

/// Converts a timestamp of unknown precision to milliseconds.
fn normalize_timestamp(raw: f64) -> i64 {
    let millis = if raw < MAX_SECONDS {
        raw * 1e3
    } else if raw < MAX_MILLIS {
        raw
    } else if raw < MAX_MICROS {
        raw / 1e3
    } else {
        raw / 1e6
    };

    millis as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(line: &str) -> Result<DecodedPoint, DecodeError> {
        WavefrontDecoder::new("localhost").decode(line)
    }

    fn tags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn test_sample() {
        let point = decode("request.latency 12.5 1533529977 source=app-1 region=us-west").unwrap();
        assert_eq!(
            point,
            DecodedPoint {
                metric: "request.latency".to_owned(),
                source: "app-1".to_owned(),
                tags: tags(&[("region", "us-west")]),
                timestamp_ms: Some(1_533_529_977_000),
                value: PointValue::Sample(12.5),
            }
        );
    }

    #[test]
    fn test_sample_defaults() {
        let point = decode("cpu.load 0.5").unwrap();
        assert_eq!(point.source, "localhost");
        assert_eq!(point.timestamp_ms, None);
        assert!(point.tags.is_empty());
    }

    #[test]
    fn test_host_is_source() {
        let point = decode("cpu.load 1 host=db-2 env=prod").unwrap();
        assert_eq!(point.source, "db-2");
        assert_eq!(point.tags, tags(&[("env", "prod")]));
    }

    #[test]
    fn test_timestamp_precision() {
        for ts in [
            "1533529977",
            "1533529977000",
            "1533529977000000",
            "1533529977000000000",
        ] {
            let point = decode(&format!("m 1 {ts} source=a")).unwrap();
            assert_eq!(point.timestamp_ms, Some(1_533_529_977_000), "{ts}");
        }
    }

    #[test]
    fn test_quoted() {
        let point =
            decode(r#""my metric" 1 source="web server" "tag key"="a \"b\"" plain="x y""#).unwrap();
        assert_eq!(point.metric, "my metric");
        assert_eq!(point.source, "web server");
        assert_eq!(
            point.tags,
            tags(&[("tag key", r#"a "b""#), ("plain", "x y")])
        );
    }

    #[test]
    fn test_distribution() {
        let point =
            decode("!M 1533529977 #20 30.0 #10 5.1 request.latency source=app-1 region=us-west")
                .unwrap();
        assert_eq!(
            point,
            DecodedPoint {
                metric: "request.latency".to_owned(),
                source: "app-1".to_owned(),
                tags: tags(&[("region", "us-west")]),
                timestamp_ms: Some(1_533_529_977_000),
                value: PointValue::Distribution {
                    granularity: Granularity::Minute,
                    centroids: vec![Centroid::new(30.0, 20), Centroid::new(5.1, 10)],
                },
            }
        );
    }

    #[test]
    fn test_distribution_granularities() {
        for (prefix, granularity) in [
            ("!M", Granularity::Minute),
            ("!H", Granularity::Hour),
            ("!D", Granularity::Day),
        ] {
            let point = decode(&format!("{prefix} #1 2 m")).unwrap();
            assert!(matches!(
                point.value,
                PointValue::Distribution { granularity: g, .. } if g == granularity
            ));
        }

        assert_eq!(
            decode("!X #1 2 m"),
            Err(DecodeError::InvalidGranularity("!X".to_owned()))
        );
    }

    #[test]
    fn test_distribution_mismatch_rejected() {
        assert_eq!(decode("!M 0 #1 2 #3 m"), Err(DecodeError::MismatchedCentroids));
        assert_eq!(decode("!M 0 #1 #3 4 m"), Err(DecodeError::MismatchedCentroids));
        assert_eq!(decode("!M 0 #1"), Err(DecodeError::MismatchedCentroids));
        assert_eq!(decode("!M 0 m source=a"), Err(DecodeError::EmptyDistribution));
        assert_eq!(
            decode("!M 0 #x 1 m"),
            Err(DecodeError::InvalidCount("x".to_owned()))
        );
    }

    #[test]
    fn test_distribution_count_overflow() {
        assert_eq!(
            decode("!M 0 #18446744073709551615 1 #1 2 m source=a"),
            Err(DecodeError::CountOverflow)
        );

        let point = decode("!M 0 #18446744073709551614 1 #1 2 m source=a").unwrap();
        assert!(matches!(point.value, PointValue::Distribution { .. }));
    }

    #[test]
    fn test_invalid_lines() {
        assert_eq!(decode("   "), Err(DecodeError::Empty));
        assert_eq!(decode("m"), Err(DecodeError::MissingValue));
        assert_eq!(decode("m abc"), Err(DecodeError::InvalidValue("abc".to_owned())));
        assert_eq!(decode("m NaN"), Err(DecodeError::NonFinite));
        assert_eq!(decode("m inf"), Err(DecodeError::NonFinite));
        assert_eq!(decode("m 1 2x"), Err(DecodeError::InvalidTimestamp("2x".to_owned())));
        assert_eq!(decode("m 1 oops"), Err(DecodeError::InvalidTag("oops".to_owned())));
        assert_eq!(decode(r#"m 1 a="b"#), Err(DecodeError::UnterminatedQuote));
    }

    #[test]
    fn test_error_display() {
        insta::assert_snapshot!(
            DecodeError::InvalidValue("abc".to_owned()).to_string(),
            @r#"invalid value "abc""#
        );
        assert_eq!(DecodeError::MismatchedCentroids.reason(), "mismatched_centroids");
    }
}
