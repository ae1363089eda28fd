use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::SchoolMasterRow;

pub const BPS_PER_MBPS: f64 = 1_000_000.0;

/// Blank or whitespace-only text is treated as absent.
pub fn normalize_text(value: Option<&str>) -> Option<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .map(ToString::to_string)
}

/// `"true"`, `"yes"` and `"1"` (any case) read as true, other non-blank text as
/// false, blank as absent.
pub fn parse_flag(value: Option<&str>) -> Option<bool> {
    let value = value?.trim();
    if value.is_empty() {
        return None;
    }
    Some(matches!(
        value.to_ascii_lowercase().as_str(),
        "true" | "yes" | "1"
    ))
}

/// `None` when the product is not a finite value that fits in an `i64`.
pub fn mbps_to_bps(value: Option<f64>) -> Option<i64> {
    value
        .map(|mbps| (mbps * BPS_PER_MBPS).round())
        .filter(|bps| bps.is_finite() && bps.abs() < i64::MAX as f64)
        .map(|bps| bps as i64)
}

/// Measurement fields of a school snapshot after normalization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchoolStaticAttributes {
    pub school_id_govt: Option<String>,
    pub education_level: Option<String>,
    pub education_level_govt: Option<String>,
    pub admin1: Option<String>,
    pub admin1_id_giga: Option<String>,
    pub admin2: Option<String>,
    pub admin2_id_giga: Option<String>,
    pub school_area_type: Option<String>,
    pub school_funding_type: Option<String>,
    pub connectivity_type_govt: Option<String>,
    pub connectivity_rt_datasource: Option<String>,
    pub school_data_source: Option<String>,
    pub school_data_collection_modality: Option<String>,
    pub electricity_type: Option<String>,
    pub cellular_coverage_type: Option<String>,
    pub building_id_govt: Option<String>,

    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub fiber_node_distance: Option<f64>,
    pub microwave_node_distance: Option<f64>,
    pub nearest_lte_distance: Option<f64>,
    pub nearest_umts_distance: Option<f64>,
    pub nearest_gsm_distance: Option<f64>,
    pub nearest_nr_distance: Option<f64>,
    pub download_speed_govt: Option<f64>,
    /// Contracted bandwidth in bits per second.
    pub download_speed_contracted: Option<i64>,
    pub download_speed_benchmark: Option<f64>,

    pub school_establishment_year: Option<i64>,
    pub connectivity_govt_collection_year: Option<i64>,
    pub school_data_collection_year: Option<i64>,
    pub num_computers: Option<i64>,
    pub num_computers_desired: Option<i64>,
    pub num_teachers: Option<i64>,
    pub num_teachers_female: Option<i64>,
    pub num_teachers_male: Option<i64>,
    pub num_adm_personnel: Option<i64>,
    pub num_students: Option<i64>,
    pub num_students_girls: Option<i64>,
    pub num_students_boys: Option<i64>,
    pub num_tablets: Option<i64>,
    pub num_robotic_equipment: Option<i64>,
    pub num_schools_per_building: Option<i64>,
    pub schools_within_1km: Option<i64>,
    pub schools_within_2km: Option<i64>,
    pub schools_within_3km: Option<i64>,
    pub pop_within_1km: Option<i64>,
    pub pop_within_2km: Option<i64>,
    pub pop_within_3km: Option<i64>,

    pub computer_availability: Option<bool>,
    pub computer_lab: Option<bool>,
    pub electricity_availability: Option<bool>,
    pub water_availability: Option<bool>,
    pub connectivity_govt: Option<bool>,
    pub connectivity: Option<bool>,
    pub connectivity_rt: Option<bool>,
    pub disputed_region: Option<bool>,
    pub cellular_coverage_availability: Option<bool>,

    pub connectivity_govt_ingestion_timestamp: Option<DateTime<Utc>>,
    pub connectivity_rt_ingestion_timestamp: Option<DateTime<Utc>>,
    pub school_location_ingestion_timestamp: Option<DateTime<Utc>>,
}

impl SchoolStaticAttributes {
    pub fn from_row(row: &SchoolMasterRow) -> Self {
        let text = |v: &Option<String>| normalize_text(v.as_deref());
        let flag = |v: &Option<String>| parse_flag(v.as_deref());
        Self {
            school_id_govt: text(&row.school_id_govt),
            education_level: text(&row.education_level),
            education_level_govt: text(&row.education_level_govt),
            admin1: text(&row.admin1),
            admin1_id_giga: text(&row.admin1_id_giga),
            admin2: text(&row.admin2),
            admin2_id_giga: text(&row.admin2_id_giga),
            school_area_type: text(&row.school_area_type),
            school_funding_type: text(&row.school_funding_type),
            connectivity_type_govt: text(&row.connectivity_type_govt),
            connectivity_rt_datasource: text(&row.connectivity_rt_datasource),
            school_data_source: text(&row.school_data_source),
            school_data_collection_modality: text(&row.school_data_collection_modality),
            electricity_type: text(&row.electricity_type),
            cellular_coverage_type: text(&row.cellular_coverage_type),
            building_id_govt: text(&row.building_id_govt),

            latitude: row.latitude,
            longitude: row.longitude,
            fiber_node_distance: row.fiber_node_distance,
            microwave_node_distance: row.microwave_node_distance,
            nearest_lte_distance: row.nearest_lte_distance,
            nearest_umts_distance: row.nearest_umts_distance,
            nearest_gsm_distance: row.nearest_gsm_distance,
            nearest_nr_distance: row.nearest_nr_distance,
            download_speed_govt: row.download_speed_govt,
            download_speed_contracted: mbps_to_bps(row.download_speed_contracted),
            download_speed_benchmark: row.download_speed_benchmark,

            school_establishment_year: row.school_establishment_year,
            connectivity_govt_collection_year: row.connectivity_govt_collection_year,
            school_data_collection_year: row.school_data_collection_year,
            num_computers: row.num_computers,
            num_computers_desired: row.num_computers_desired,
            num_teachers: row.num_teachers,
            num_teachers_female: row.num_teachers_female,
            num_teachers_male: row.num_teachers_male,
            num_adm_personnel: row.num_adm_personnel,
            num_students: row.num_students,
            num_students_girls: row.num_students_girls,
            num_students_boys: row.num_students_boys,
            num_tablets: row.num_tablets,
            num_robotic_equipment: row.num_robotic_equipment,
            num_schools_per_building: row.num_schools_per_building,
            schools_within_1km: row.schools_within_1km,
            schools_within_2km: row.schools_within_2km,
            schools_within_3km: row.schools_within_3km,
            pop_within_1km: row.pop_within_1km,
            pop_within_2km: row.pop_within_2km,
            pop_within_3km: row.pop_within_3km,

            computer_availability: flag(&row.computer_availability),
            computer_lab: flag(&row.computer_lab),
            electricity_availability: flag(&row.electricity_availability),
            water_availability: flag(&row.water_availability),
            connectivity_govt: flag(&row.connectivity_govt),
            connectivity: flag(&row.connectivity),
            connectivity_rt: flag(&row.connectivity_rt),
            disputed_region: flag(&row.disputed_region),
            cellular_coverage_availability: flag(&row.cellular_coverage_availability),

            connectivity_govt_ingestion_timestamp: row.connectivity_govt_ingestion_timestamp,
            connectivity_rt_ingestion_timestamp: row.connectivity_rt_ingestion_timestamp,
            school_location_ingestion_timestamp: row.school_location_ingestion_timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_follow_truthy_words() {
        assert_eq!(parse_flag(Some("TRUE")), Some(true));
        assert_eq!(parse_flag(Some("Yes")), Some(true));
        assert_eq!(parse_flag(Some("1")), Some(true));
        assert_eq!(parse_flag(Some("no")), Some(false));
        assert_eq!(parse_flag(Some("unknown")), Some(false));
        assert_eq!(parse_flag(Some("")), None);
        assert_eq!(parse_flag(Some("  ")), None);
        assert_eq!(parse_flag(None), None);
    }

    #[test]
    fn bandwidth_converts_mbps_to_bps() {
        assert_eq!(mbps_to_bps(Some(10.0)), Some(10_000_000));
        assert_eq!(mbps_to_bps(Some(0.5)), Some(500_000));
        assert_eq!(mbps_to_bps(None), None);
    }

    #[test]
    fn bandwidth_outside_i64_is_absent() {
        assert_eq!(mbps_to_bps(Some(f64::INFINITY)), None);
        assert_eq!(mbps_to_bps(Some(f64::NEG_INFINITY)), None);
        assert_eq!(mbps_to_bps(Some(f64::NAN)), None);
        assert_eq!(mbps_to_bps(Some(1e300)), None);
    }

    #[test]
    fn snapshot_attributes_normalize_the_row() {
        let mut row = SchoolMasterRow::new("S1");
        row.admin1 = Some("".into());
        row.admin2 = Some("District 9".into());
        row.computer_availability = Some("yes".into());
        row.water_availability = Some("".into());
        row.connectivity_rt = Some("False".into());
        row.download_speed_contracted = Some(20.0);
        row.num_students = Some(120);

        let attrs = SchoolStaticAttributes::from_row(&row);
        assert_eq!(attrs.admin1, None);
        assert_eq!(attrs.admin2.as_deref(), Some("District 9"));
        assert_eq!(attrs.computer_availability, Some(true));
        assert_eq!(attrs.water_availability, None);
        assert_eq!(attrs.connectivity_rt, Some(false));
        assert_eq!(attrs.download_speed_contracted, Some(20_000_000));
        assert_eq!(attrs.num_students, Some(120));
    }
}
