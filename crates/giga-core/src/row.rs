use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Column carrying the school natural key in the change feed.
pub const NATURAL_KEY_COLUMN: &str = "school_id_giga";

/// One school master data row as published by the change feed.
///
/// The field set is the allow-list of columns the destination keeps: feed columns
/// without a field here (source bookkeeping, `id`, `created`, `modified`, `status`,
/// foreign keys) are dropped during deserialization. Feed values arrive loosely
/// typed, so every field goes through a [`lenient`] deserializer. Flag columns stay
/// raw text here and are interpreted during reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchoolMasterRow {
    pub school_id_giga: String,

    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub school_id_govt: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub school_name: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub education_level: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub education_level_govt: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub admin1: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub admin1_id_giga: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub admin2: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub admin2_id_giga: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub school_area_type: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub school_funding_type: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub connectivity_type_govt: Option<String>,
    #[serde(
        default,
        rename = "connectivity_RT_datasource",
        deserialize_with = "lenient::opt_string"
    )]
    pub connectivity_rt_datasource: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub school_data_source: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub school_data_collection_modality: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub electricity_type: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub cellular_coverage_type: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub building_id_govt: Option<String>,

    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub latitude: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub longitude: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub fiber_node_distance: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub microwave_node_distance: Option<f64>,
    #[serde(default, rename = "nearest_LTE_distance", deserialize_with = "lenient::opt_f64")]
    pub nearest_lte_distance: Option<f64>,
    #[serde(default, rename = "nearest_UMTS_distance", deserialize_with = "lenient::opt_f64")]
    pub nearest_umts_distance: Option<f64>,
    #[serde(default, rename = "nearest_GSM_distance", deserialize_with = "lenient::opt_f64")]
    pub nearest_gsm_distance: Option<f64>,
    #[serde(default, rename = "nearest_NR_distance", deserialize_with = "lenient::opt_f64")]
    pub nearest_nr_distance: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub download_speed_govt: Option<f64>,
    /// Contracted bandwidth in Mbps.
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub download_speed_contracted: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub download_speed_benchmark: Option<f64>,

    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub school_establishment_year: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub connectivity_govt_collection_year: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub school_data_collection_year: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub num_computers: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub num_computers_desired: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub num_teachers: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub num_teachers_female: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub num_teachers_male: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub num_adm_personnel: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub num_students: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub num_students_girls: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub num_students_boys: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub num_tablets: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub num_robotic_equipment: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub num_schools_per_building: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub schools_within_1km: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub schools_within_2km: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub schools_within_3km: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub pop_within_1km: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub pop_within_2km: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub pop_within_3km: Option<i64>,

    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub computer_availability: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub computer_lab: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub electricity_availability: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub water_availability: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub connectivity_govt: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub connectivity: Option<String>,
    #[serde(default, rename = "connectivity_RT", deserialize_with = "lenient::opt_string")]
    pub connectivity_rt: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub disputed_region: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub cellular_coverage_availability: Option<String>,

    #[serde(default, deserialize_with = "lenient::opt_timestamp")]
    pub connectivity_govt_ingestion_timestamp: Option<DateTime<Utc>>,
    #[serde(
        default,
        rename = "connectivity_RT_ingestion_timestamp",
        deserialize_with = "lenient::opt_timestamp"
    )]
    pub connectivity_rt_ingestion_timestamp: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient::opt_timestamp")]
    pub school_location_ingestion_timestamp: Option<DateTime<Utc>>,
}

impl SchoolMasterRow {
    pub fn new(school_id_giga: impl Into<String>) -> Self {
        Self {
            school_id_giga: school_id_giga.into(),
            ..Default::default()
        }
    }
}

/// Deserializers that accept the loosely typed values a feed publishes
/// (numbers as text, integral floats for counts, several timestamp layouts).
pub mod lenient {
    use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn opt_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        match Option::<Value>::deserialize(d)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(Value::Bool(b)) => Ok(Some(b.to_string())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(other) => Err(D::Error::custom(format!("expected text, found {other}"))),
        }
    }

    pub fn opt_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        match Option::<Value>::deserialize(d)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_f64()
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("number {n} is not representable as f64"))),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            // NaN and infinities have no JSON or column form; treat them like a blank.
            Some(Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .map(|v| v.is_finite().then_some(v))
                .map_err(|_| D::Error::custom(format!("cannot read {s:?} as a number"))),
            Some(other) => Err(D::Error::custom(format!("expected a number, found {other}"))),
        }
    }

    pub fn opt_i64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
        match Option::<Value>::deserialize(d)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => {
                if let Some(v) = n.as_i64() {
                    return Ok(Some(v));
                }
                n.as_f64()
                    .and_then(integral)
                    .map(Some)
                    .ok_or_else(|| D::Error::custom(format!("number {n} is not an integer")))
            }
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(Value::String(s)) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().and_then(integral))
                    .map(Some)
                    .ok_or_else(|| D::Error::custom(format!("cannot read {s:?} as an integer")))
            }
            Some(other) => Err(D::Error::custom(format!("expected an integer, found {other}"))),
        }
    }

    /// Accepts RFC 3339, naive `YYYY-MM-DD[ T]HH:MM:SS[.f]` (read as UTC), a bare date,
    /// or epoch milliseconds.
    pub fn opt_timestamp<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        match Option::<Value>::deserialize(d)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_i64()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("invalid epoch milliseconds {n}"))),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(Value::String(s)) => parse_timestamp(s.trim())
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("cannot read {s:?} as a timestamp"))),
            Some(other) => Err(D::Error::custom(format!("expected a timestamp, found {other}"))),
        }
    }

    pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Some(ts.with_timezone(&Utc));
        }
        for layout in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(raw, layout) {
                return Some(naive.and_utc());
            }
        }
        NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|naive| naive.and_utc())
    }

    fn integral(v: f64) -> Option<i64> {
        (v.is_finite() && v.fract() == 0.0 && v.abs() < i64::MAX as f64).then_some(v as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SchoolStaticAttributes;
    use serde_json::json;

    #[test]
    fn unknown_and_bookkeeping_columns_are_dropped() {
        let row: SchoolMasterRow = serde_json::from_value(json!({
            "school_id_giga": "abc",
            "id": 42,
            "created": "2024-01-01",
            "status": "PUBLISHED",
            "some_source_internal": "x",
            "school_name": "Escola",
        }))
        .expect("row");
        assert_eq!(row.school_id_giga, "abc");
        assert_eq!(row.school_name.as_deref(), Some("Escola"));
    }

    #[test]
    fn non_finite_numbers_read_as_absent() {
        let row: SchoolMasterRow = serde_json::from_value(json!({
            "school_id_giga": "abc",
            "latitude": "inf",
            "longitude": "-Infinity",
            "download_speed_contracted": "NaN",
        }))
        .expect("row");
        assert_eq!(row.latitude, None);
        assert_eq!(row.longitude, None);
        assert_eq!(row.download_speed_contracted, None);
        assert_eq!(SchoolStaticAttributes::from_row(&row).download_speed_contracted, None);
    }

    #[test]
    fn loosely_typed_values_are_coerced() {
        let row: SchoolMasterRow = serde_json::from_value(json!({
            "school_id_giga": "abc",
            "school_id_govt": 1234,
            "latitude": "-12.5",
            "num_students": 310.0,
            "num_teachers": "12",
            "pop_within_1km": "",
            "computer_availability": true,
            "connectivity_RT": "Yes",
            "nearest_LTE_distance": 1.25,
            "school_location_ingestion_timestamp": "2024-03-01 10:00:00",
            "connectivity_govt_ingestion_timestamp": 1709287200000i64,
        }))
        .expect("row");
        assert_eq!(row.school_id_govt.as_deref(), Some("1234"));
        assert_eq!(row.latitude, Some(-12.5));
        assert_eq!(row.num_students, Some(310));
        assert_eq!(row.num_teachers, Some(12));
        assert_eq!(row.pop_within_1km, None);
        assert_eq!(row.computer_availability.as_deref(), Some("true"));
        assert_eq!(row.connectivity_rt.as_deref(), Some("Yes"));
        assert_eq!(row.nearest_lte_distance, Some(1.25));
        assert_eq!(
            row.school_location_ingestion_timestamp.map(|t| t.to_rfc3339()),
            Some("2024-03-01T10:00:00+00:00".to_string())
        );
        assert!(row.connectivity_govt_ingestion_timestamp.is_some());
    }

    #[test]
    fn non_integral_counts_are_rejected() {
        let err = serde_json::from_value::<SchoolMasterRow>(json!({
            "school_id_giga": "abc",
            "num_students": 12.5,
        }))
        .expect_err("fractional count");
        assert!(err.to_string().contains("not an integer"));
    }

    #[test]
    fn staged_json_round_trips_through_lenient_fields() {
        let mut row = SchoolMasterRow::new("abc");
        row.latitude = Some(1.5);
        row.num_students = Some(10);
        row.connectivity_rt = Some("no".into());
        let back: SchoolMasterRow =
            serde_json::from_value(serde_json::to_value(&row).expect("ser")).expect("de");
        assert_eq!(back, row);
    }
}
