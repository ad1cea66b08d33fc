// =============================================================================
// SERIAL ISSUANCE
// =============================================================================
// Serial = product code + per-product sequence + random anti-counterfeit
// suffix, e.g. "KEY0427QX9". Sequences are handed out by the store, which
// owns the per-product counter.
// =============================================================================

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use sqlx::FromRow;

pub const ANTI_COUNTERFEIT_LEN: usize = 4;
const ANTI_COUNTERFEIT_CHARSET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct Serial {
    pub id: i64,
    pub serial_number: String,
    pub product_code: String,
    pub sequence_number: i64,
    pub anti_counterfeit_code: String,
    pub order_id: i64,
    pub order_no: String,
    pub product_id: i64,
    /// Informational only.
    pub view_count: i64,
    pub first_viewed_at: Option<DateTime<Utc>>,
    pub last_viewed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Serial {
    pub fn record_view(&mut self, now: DateTime<Utc>) {
        self.view_count += 1;
        self.first_viewed_at.get_or_insert(now);
        self.last_viewed_at = Some(now);
    }
}

/// Request to issue one serial per anti-counterfeit code.
#[derive(Debug, Clone)]
pub struct NewSerials {
    pub order_id: i64,
    pub order_no: String,
    pub product_id: i64,
    pub product_code: String,
    pub anti_codes: Vec<String>,
}

impl NewSerials {
    pub fn generate(order_id: i64, order_no: &str, product_id: i64, product_code: &str, count: usize) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            order_id,
            order_no: order_no.to_string(),
            product_id,
            product_code: product_code.to_string(),
            anti_codes: (0..count).map(|_| anti_counterfeit_code(&mut rng)).collect(),
        }
    }
}

/// Width grows with the sequence: 3 digits below 1000, 4 below 10000,
/// 5 below 100000, unpadded beyond.
pub fn format_sequence(seq: i64) -> String {
    match seq {
        s if s < 1_000 => format!("{s:03}"),
        s if s < 10_000 => format!("{s:04}"),
        s if s < 100_000 => format!("{s:05}"),
        s => s.to_string(),
    }
}

pub fn anti_counterfeit_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..ANTI_COUNTERFEIT_LEN)
        .map(|_| char::from(ANTI_COUNTERFEIT_CHARSET[rng.gen_range(0..ANTI_COUNTERFEIT_CHARSET.len())]))
        .collect()
}

pub fn serial_number(product_code: &str, sequence: i64, anti_code: &str) -> String {
    format!("{}{}{}", product_code, format_sequence(sequence), anti_code)
}

pub fn normalize_serial(input: &str) -> String {
    input.trim().to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_padding_grows() {
        assert_eq!(format_sequence(7), "007");
        assert_eq!(format_sequence(999), "999");
        assert_eq!(format_sequence(1000), "1000");
        assert_eq!(format_sequence(42_000), "42000");
        assert_eq!(format_sequence(1_234_567), "1234567");
    }

    #[test]
    fn serial_layout() {
        assert_eq!(serial_number("KEY", 12, "A1B2"), "KEY012A1B2");
    }

    #[test]
    fn anti_counterfeit_codes_use_the_charset() {
        let mut rng = rand::thread_rng();
        let code = anti_counterfeit_code(&mut rng);
        assert_eq!(code.len(), ANTI_COUNTERFEIT_LEN);
        assert!(code.bytes().all(|b| ANTI_COUNTERFEIT_CHARSET.contains(&b)));
    }

    #[test]
    fn views_are_counted() {
        let now = Utc::now();
        let mut serial = Serial {
            id: 1,
            serial_number: "KEY001AAAA".into(),
            product_code: "KEY".into(),
            sequence_number: 1,
            anti_counterfeit_code: "AAAA".into(),
            order_id: 1,
            order_no: "ORD1".into(),
            product_id: 1,
            view_count: 0,
            first_viewed_at: None,
            last_viewed_at: None,
            created_at: now,
        };
        serial.record_view(now);
        serial.record_view(now + chrono::Duration::seconds(5));
        assert_eq!(serial.view_count, 2);
        assert_eq!(serial.first_viewed_at, Some(now));
        assert!(serial.last_viewed_at > serial.first_viewed_at);
    }
}
