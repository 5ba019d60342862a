use chrono::NaiveDate;

pub const PARTITION_EXTENSION: &str = "enc";

/// This is the standard way of naming a day partition file in workwatch.
pub fn date_to_partition_name(date: NaiveDate) -> String {
    format!("{}.{PARTITION_EXTENSION}", date.format("%Y-%m-%d"))
}

/// Inverse of [date_to_partition_name]. Returns [None] for files that don't
/// follow the partition naming scheme.
pub fn partition_name_to_date(name: &str) -> Option<NaiveDate> {
    let stem = name.strip_suffix(&format!(".{PARTITION_EXTENSION}"))?;
    NaiveDate::parse_from_str(stem, "%Y-%m-%d").ok()
}
