//! Data normalizer: deterministic, pure canonicalization of user-supplied
//! task parameters, keyed by field name rather than capability — every
//! capability that accepts a `location`, `date`, `language`, `currency` or
//! `symbol` parameter gets the same canonicalization for free.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};
use serde_json::{Map, Value};

/// Failure normalizing a single parameter.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
#[error("failed to normalize field '{field}' (value '{value}'): {reason}")]
pub struct NormalizationError {
    /// Name of the field that failed to normalize.
    pub field: String,
    /// The raw value that could not be normalized.
    pub value: String,
    /// Human-readable reason.
    pub reason: String,
}

impl NormalizationError {
    fn new(field: &str, value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self { field: field.to_string(), value: value.into(), reason: reason.into() }
    }
}

/// Recognized parameter field names this normalizer canonicalizes.
const RECOGNIZED_FIELDS: &[&str] = &["location", "date", "language", "currency", "symbol"];

/// Normalize every recognized field in `params` in place. Unrecognized keys
/// are passed through untouched. Returns the first field that fails to
/// normalize; callers decide (per spec.md §4.3) whether to reject the task
/// or fall back to the raw value.
pub fn normalize_params(params: &mut Map<String, Value>) -> Result<(), NormalizationError> {
    for field in RECOGNIZED_FIELDS {
        let Some(raw) = params.get(*field).and_then(Value::as_str).map(str::to_string) else {
            continue;
        };
        let normalized = match *field {
            "location" => Value::String(normalize_location(&raw)?),
            "date" => Value::String(normalize_date(&raw, Utc::now())?),
            "language" => Value::String(normalize_language(&raw)?),
            "currency" => normalize_currency(&raw)?,
            "symbol" => Value::String(normalize_symbol(&raw)?),
            _ => unreachable!(),
        };
        params.insert((*field).to_string(), normalized);
    }
    Ok(())
}

/// Canonicalize a location into `"City,CC"` form. A value that already
/// looks like a 3-letter IATA-style code is returned as-is.
pub fn normalize_location(raw: &str) -> Result<String, NormalizationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(NormalizationError::new("location", raw, "location is empty"));
    }
    if trimmed.len() == 3 && trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
        return Ok(trimmed.to_uppercase());
    }
    let mut parts = trimmed.rsplitn(2, ',');
    let country_part = parts.next().unwrap_or_default().trim();
    let city_part = parts.next().unwrap_or(country_part).trim();
    if city_part.is_empty() {
        return Err(NormalizationError::new("location", raw, "missing city segment"));
    }
    let city = title_case(city_part);
    let country = country_to_iso2(country_part).unwrap_or_else(|| country_part.to_uppercase());
    Ok(format!("{city},{country}"))
}

fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn country_to_iso2(raw: &str) -> Option<String> {
    let lower = raw.to_lowercase();
    let code = match lower.as_str() {
        "fr" | "france" => "FR",
        "us" | "usa" | "united states" | "united states of america" => "US",
        "uk" | "gb" | "united kingdom" | "great britain" => "GB",
        "de" | "germany" => "DE",
        "jp" | "japan" => "JP",
        "pt" | "portugal" => "PT",
        "es" | "spain" => "ES",
        "it" | "italy" => "IT",
        "ca" | "canada" => "CA",
        "au" | "australia" => "AU",
        _ if raw.len() == 2 && raw.chars().all(|c| c.is_ascii_alphabetic()) => {
            return Some(raw.to_uppercase());
        }
        _ => return None,
    };
    Some(code.to_string())
}

/// Canonicalize a date expression (`today`, `tomorrow`, a weekday name, or
/// an already-ISO `YYYY-MM-DD` date) into an ISO-8601 UTC date string.
pub fn normalize_date(raw: &str, now: DateTime<Utc>) -> Result<String, NormalizationError> {
    let trimmed = raw.trim();
    if let Ok(parsed) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Ok(parsed.format("%Y-%m-%d").to_string());
    }
    let lower = trimmed.to_lowercase();
    let today = now.date_naive();
    let resolved = match lower.as_str() {
        "today" => today,
        "tomorrow" => today + Duration::days(1),
        "yesterday" => today - Duration::days(1),
        _ => {
            if let Some(weekday) = parse_weekday(&lower) {
                next_weekday(today, weekday)
            } else {
                return Err(NormalizationError::new(
                    "date",
                    raw,
                    "unrecognized date expression; expected YYYY-MM-DD, today/tomorrow, or a weekday name",
                ));
            }
        }
    };
    Ok(resolved.format("%Y-%m-%d").to_string())
}

fn parse_weekday(lower: &str) -> Option<Weekday> {
    Some(match lower {
        "monday" => Weekday::Mon,
        "tuesday" => Weekday::Tue,
        "wednesday" => Weekday::Wed,
        "thursday" => Weekday::Thu,
        "friday" => Weekday::Fri,
        "saturday" => Weekday::Sat,
        "sunday" => Weekday::Sun,
        _ => return None,
    })
}

fn next_weekday(from: NaiveDate, target: Weekday) -> NaiveDate {
    let mut candidate = from + Duration::days(1);
    while candidate.weekday() != target {
        candidate += Duration::days(1);
    }
    candidate
}

/// Canonicalize a language into a lowercase two-letter code.
pub fn normalize_language(raw: &str) -> Result<String, NormalizationError> {
    let lower = raw.trim().to_lowercase();
    if lower.len() == 2 && lower.chars().all(|c| c.is_ascii_alphabetic()) {
        return Ok(lower);
    }
    let code = match lower.as_str() {
        "french" => "fr",
        "english" => "en",
        "spanish" => "es",
        "german" => "de",
        "portuguese" => "pt",
        "italian" => "it",
        "japanese" => "ja",
        "mandarin" | "chinese" => "zh",
        _ => {
            return Err(NormalizationError::new(
                "language",
                raw,
                "unrecognized language; expected a two-letter code or a known language name",
            ))
        }
    };
    Ok(code.to_string())
}

/// Canonicalize free-text price into `{amount, currency}`.
pub fn normalize_currency(raw: &str) -> Result<Value, NormalizationError> {
    let trimmed = raw.trim();

    // Already-normalized structured form, re-emitted unchanged.
    if let Ok(existing) = serde_json::from_str::<Value>(trimmed) {
        if let Some(obj) = existing.as_object() {
            if obj.contains_key("amount") && obj.contains_key("currency") {
                return Ok(existing);
            }
        }
    }

    let lower = trimmed.to_lowercase();
    let (symbol_or_word, rest): (Option<&str>, &str) = if let Some(rest) = trimmed.strip_prefix('$') {
        (Some("$"), rest)
    } else if let Some(rest) = trimmed.strip_prefix('€') {
        (Some("€"), rest)
    } else if let Some(rest) = trimmed.strip_prefix('£'){
        (Some("£"), rest)
    } else {
        (None, trimmed)
    };

    let currency = if let Some(symbol) = symbol_or_word {
        match symbol {
            "$" => "USD",
            "€" => "EUR",
            "£" => "GBP",
            _ => unreachable!(),
        }
    } else if lower.contains("euro") {
        "EUR"
    } else if lower.contains("dollar") {
        "USD"
    } else if lower.contains("pound") || lower.contains("sterling") {
        "GBP"
    } else if lower.contains("yen") {
        "JPY"
    } else {
        return Err(NormalizationError::new("currency", raw, "could not determine currency from input"));
    };

    let amount_str: String = rest
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let amount: f64 = amount_str
        .parse()
        .map_err(|_| NormalizationError::new("currency", raw, "could not parse a numeric amount"))?;

    Ok(serde_json::json!({ "amount": amount, "currency": currency }))
}

/// Canonicalize a stock ticker: upper-case, strip a trailing exchange
/// suffix (`.O`, `.N`, `.L`, ...) unless the remainder would be empty.
pub fn normalize_symbol(raw: &str) -> Result<String, NormalizationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(NormalizationError::new("symbol", raw, "symbol is empty"));
    }
    let upper = trimmed.to_uppercase();
    if let Some((base, suffix)) = upper.rsplit_once('.') {
        if !base.is_empty() && suffix.len() <= 2 && suffix.chars().all(|c| c.is_ascii_alphabetic()) {
            return Ok(base.to_string());
        }
    }
    Ok(upper)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_titlecases_city_and_upcases_country() {
        assert_eq!(normalize_location("nice, fr").unwrap(), "Nice,FR");
    }

    #[test]
    fn location_maps_country_name_to_iso2() {
        assert_eq!(normalize_location("paris, france").unwrap(), "Paris,FR");
    }

    #[test]
    fn location_keeps_iata_like_codes_as_is() {
        assert_eq!(normalize_location("LIS").unwrap(), "LIS");
    }

    #[test]
    fn location_normalization_is_idempotent() {
        let once = normalize_location("nice, fr").unwrap();
        let twice = normalize_location(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn date_accepts_iso_and_relative_keywords() {
        let now = DateTime::parse_from_rfc3339("2026-07-28T00:00:00Z").unwrap().with_timezone(&Utc);
        assert_eq!(normalize_date("2026-08-01", now).unwrap(), "2026-08-01");
        assert_eq!(normalize_date("today", now).unwrap(), "2026-07-28");
        assert_eq!(normalize_date("tomorrow", now).unwrap(), "2026-07-29");
    }

    #[test]
    fn date_rejects_unknown_expressions() {
        let now = Utc::now();
        assert!(normalize_date("next quarter", now).is_err());
    }

    #[test]
    fn date_normalization_is_idempotent() {
        let now = Utc::now();
        let once = normalize_date("today", now).unwrap();
        let twice = normalize_date(&once, now).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn language_maps_common_names() {
        assert_eq!(normalize_language("French").unwrap(), "fr");
        assert_eq!(normalize_language("EN").unwrap(), "en");
    }

    #[test]
    fn currency_parses_symbol_and_word_forms() {
        let euros = normalize_currency("120 euros").unwrap();
        assert_eq!(euros["currency"], "EUR");
        assert_eq!(euros["amount"], 120.0);

        let dollars = normalize_currency("$45.50").unwrap();
        assert_eq!(dollars["currency"], "USD");
        assert_eq!(dollars["amount"], 45.5);
    }

    #[test]
    fn currency_normalization_is_idempotent() {
        let once = normalize_currency("$45.50").unwrap();
        let twice = normalize_currency(&once.to_string()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn symbol_strips_exchange_suffix() {
        assert_eq!(normalize_symbol("aapl.o").unwrap(), "AAPL");
        assert_eq!(normalize_symbol("msft").unwrap(), "MSFT");
    }

    #[test]
    fn normalize_params_passes_through_unrecognized_fields() {
        let mut params = Map::new();
        params.insert("location".to_string(), Value::String("nice, fr".to_string()));
        params.insert("query".to_string(), Value::String("anything".to_string()));
        normalize_params(&mut params).unwrap();
        assert_eq!(params["location"], "Nice,FR");
        assert_eq!(params["query"], "anything");
    }
}
