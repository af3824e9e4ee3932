use std::collections::BTreeMap;

const ENTRY_SEPARATOR: char = ',';
const VALUE_SEPARATOR: char = '=';
const BARE_KEY_VALUE: &str = "true";

/// `k1=v1,k2=v2` into a map. The first occurrence of a key wins, a key
/// without `=` is stored as `"true"`, and values that fail to decode are kept
/// as they were sent.
pub(super) fn parse_header(header: &str) -> BTreeMap<String, String> {
  let mut values = BTreeMap::new();

  for entry in header.split(ENTRY_SEPARATOR) {
    let (key, value) = match entry.split_once(VALUE_SEPARATOR) {
      Some((key, raw)) => (key.trim(), decode_value(raw.trim())),
      None => (entry.trim(), BARE_KEY_VALUE.to_string()),
    };

    if key.is_empty() || values.contains_key(key) {
      continue;
    }
    values.insert(key.to_string(), value);
  }

  values
}

pub(super) fn generate_header(values: &BTreeMap<String, String>) -> String {
  values
    .iter()
    .map(|(key, value)| format!("{key}{VALUE_SEPARATOR}{}", urlencoding::encode(value)))
    .collect::<Vec<_>>()
    .join(",")
}

fn decode_value(raw: &str) -> String {
  let spaced = raw.replace('+', " ");
  match urlencoding::decode(&spaced) {
    Ok(decoded) => decoded.into_owned(),
    Err(_) => raw.to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_pairs() {
    let values = parse_header("tenancy=acme,correlation_id=abc-123");
    assert_eq!(values.get("tenancy").map(String::as_str), Some("acme"));
    assert_eq!(values.get("correlation_id").map(String::as_str), Some("abc-123"));
  }

  #[test]
  fn test_first_key_wins() {
    let values = parse_header("user=first,user=second");
    assert_eq!(values.get("user").map(String::as_str), Some("first"));
  }

  #[test]
  fn test_bare_key_is_true() {
    let values = parse_header("debug,tenancy=acme");
    assert_eq!(values.get("debug").map(String::as_str), Some("true"));
  }

  #[test]
  fn test_values_are_decoded() {
    let values = parse_header("name=jane%20doe,query=a+b,eq=x%3Dy");
    assert_eq!(values.get("name").map(String::as_str), Some("jane doe"));
    assert_eq!(values.get("query").map(String::as_str), Some("a b"));
    assert_eq!(values.get("eq").map(String::as_str), Some("x=y"));
  }

  #[test]
  fn test_undecodable_value_is_kept_raw() {
    // %FF alone is not valid UTF-8
    let values = parse_header("raw=%FF");
    assert_eq!(values.get("raw").map(String::as_str), Some("%FF"));
  }

  #[test]
  fn test_empty_entries_are_skipped() {
    let values = parse_header(",, =x,ok=1,");
    assert_eq!(values.len(), 1);
    assert_eq!(values.get("ok").map(String::as_str), Some("1"));
  }

  #[test]
  fn test_empty_header() {
    assert!(parse_header("").is_empty());
  }

  #[test]
  fn test_generate_encodes_values() {
    let mut values = BTreeMap::new();
    values.insert("b".to_string(), "x,y=z".to_string());
    values.insert("a".to_string(), "jane doe".to_string());
    let header = generate_header(&values);
    assert_eq!(header, "a=jane%20doe,b=x%2Cy%3Dz");
    assert_eq!(parse_header(&header), values);
  }
}
