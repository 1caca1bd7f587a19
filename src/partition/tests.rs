use super::*;

fn month(year: i32, month: u32) -> PartitionMonth {
    PartitionMonth::new(year, month).unwrap()
}

#[test]
fn test_new_rejects_out_of_range_months() {
    assert!(PartitionMonth::new(2026, 0).is_none());
    assert!(PartitionMonth::new(2026, 13).is_none());
    assert!(PartitionMonth::new(2026, 12).is_some());
}

#[test]
fn test_offset_crosses_year_boundaries() {
    assert_eq!(month(2026, 11).offset(3), month(2027, 2));
    assert_eq!(month(2026, 1).offset(-1), month(2025, 12));
    assert_eq!(month(2026, 3).offset(-15), month(2024, 12));
    assert_eq!(month(2026, 12).next(), month(2027, 1));
    assert_eq!(month(2026, 5).offset(0), month(2026, 5));
}

#[test]
fn test_table_name_round_trip() {
    let m = month(2026, 3);
    assert_eq!(m.table_name(), "metric_value_y2026m03");
    assert_eq!(PartitionMonth::from_table_name("metric_value_y2026m03"), Some(m));
    assert_eq!(m.to_string(), "2026-03");
}

#[test]
fn test_from_table_name_ignores_foreign_tables() {
    for name in [
        "metric_value",
        "metric_value_default",
        "metric_value_y2026m3",
        "metric_value_y2026m13",
        "metric_value_y26m03",
        "metric_value_y2026m0x",
        "other_y2026m03",
    ] {
        assert_eq!(PartitionMonth::from_table_name(name), None, "{name}");
    }
}

#[test]
fn test_bounds_cover_whole_month() {
    let m = month(2026, 12);
    assert_eq!(m.lower_bound().to_rfc3339(), "2026-12-01T00:00:00+00:00");
    assert_eq!(m.upper_bound().to_rfc3339(), "2027-01-01T00:00:00+00:00");

    let ts = Utc.with_ymd_and_hms(2026, 12, 31, 23, 59, 59).unwrap();
    assert_eq!(PartitionMonth::of(ts), m);
}

#[test]
fn test_create_table_sql() {
    assert_eq!(
        month(2026, 12).create_table_sql(),
        "CREATE TABLE IF NOT EXISTS metric_value_y2026m12 PARTITION OF metric_value \
         FOR VALUES FROM ('2026-12-01 00:00:00+00') TO ('2027-01-01 00:00:00+00')"
    );
    assert_eq!(
        month(2026, 1).drop_table_sql(),
        "DROP TABLE IF EXISTS metric_value_y2026m01"
    );
}

#[test]
fn test_range_forward_includes_current_month() {
    let range = month(2026, 11).range_forward(3);
    assert_eq!(
        range,
        vec![month(2026, 11), month(2026, 12), month(2027, 1), month(2027, 2)]
    );
    assert_eq!(month(2026, 11).range_forward(0), vec![month(2026, 11)]);
}

#[test]
fn test_missing_months_only_returns_absent_partitions() {
    let wanted = month(2026, 10).range_forward(2);
    let existing = vec![
        "metric_value_y2026m10".to_string(),
        "metric_value_y2026m12".to_string(),
        "metric_value_default".to_string(),
    ];
    assert_eq!(missing_months(&wanted, &existing), vec![month(2026, 11)]);

    // A second pass after creating everything has nothing left to do.
    let all: Vec<String> = wanted.iter().map(|m| m.table_name()).collect();
    assert!(missing_months(&wanted, &all).is_empty());
}

#[test]
fn test_expired_months_are_sorted_and_strict() {
    let existing = vec![
        "metric_value_y2025m11".to_string(),
        "metric_value_y2025m09".to_string(),
        "metric_value_y2025m10".to_string(),
        "metric_value_y2026m01".to_string(),
        "archive_2019".to_string(),
    ];
    let cutoff = month(2025, 11);
    assert_eq!(
        expired_months(&existing, cutoff),
        vec![month(2025, 9), month(2025, 10)]
    );
}

#[test]
fn test_retention_cutoff_keeps_requested_months() {
    let cutoff = retention_cutoff(month(2026, 10), 12);
    assert_eq!(cutoff, month(2025, 10));

    let existing: Vec<String> = month(2025, 8)
        .range_forward(14)
        .iter()
        .map(|m| m.table_name())
        .collect();
    assert_eq!(
        expired_months(&existing, cutoff),
        vec![month(2025, 8), month(2025, 9)]
    );
    assert_eq!(retention_cutoff(month(2026, 10), 0), month(2026, 10));
}

#[test]
fn test_six_month_look_ahead_is_idempotent() {
    let wanted = month(2026, 10).range_forward(6);
    let first = missing_months(&wanted, &[]);
    assert_eq!(first.len(), 7);

    let created: Vec<String> = first.iter().map(|m| m.table_name()).collect();
    assert!(missing_months(&wanted, &created).is_empty());
}
