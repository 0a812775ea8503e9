use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use tracing::{debug, warn};

use crate::model::{AggregateBucket, AggregateTable, Granularity, YieldRecord, YieldTable};
use crate::util::parse_timestamp;

use super::mean;

/// Calendar bucket for one timestamp. Variants never mix within one
/// aggregation, so the derived ordering is chronological.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Period {
    Day(NaiveDate),
    Week { iso_year: i32, week: u32 },
    Month { year: i32, month: u32 },
    Quarter { year: i32, quarter: u32 },
}

impl Period {
    fn containing(timestamp: NaiveDateTime, granularity: Granularity) -> Option<Self> {
        let date = timestamp.date();
        match granularity {
            Granularity::Daily => Some(Self::Day(date)),
            Granularity::Weekly => {
                let iso = date.iso_week();
                Some(Self::Week {
                    iso_year: iso.year(),
                    week: iso.week(),
                })
            }
            Granularity::Monthly => Some(Self::Month {
                year: date.year(),
                month: date.month(),
            }),
            Granularity::Quarterly => Some(Self::Quarter {
                year: date.year(),
                quarter: date.month0() / 3 + 1,
            }),
            Granularity::BulkId => None,
        }
    }

    fn label(&self) -> String {
        match self {
            Self::Day(date) => date.format("%Y-%m-%d").to_string(),
            Self::Week { iso_year, week } => format!("{iso_year}WW{week:02}"),
            Self::Month { month, .. } => month.to_string(),
            Self::Quarter { year, quarter } => format!("{year}Q{quarter}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Category {
    Bulk(String),
    Period(Period),
}

impl Category {
    fn of(row: &YieldRecord, granularity: Granularity) -> Option<Self> {
        match granularity {
            Granularity::BulkId => row.bulk_id.clone().map(Self::Bulk),
            _ => row
                .time
                .as_deref()
                .and_then(parse_timestamp)
                .and_then(|timestamp| Period::containing(timestamp, granularity))
                .map(Self::Period),
        }
    }

    fn label(&self) -> String {
        match self {
            Self::Bulk(bulk_id) => bulk_id.clone(),
            Self::Period(period) => period.label(),
        }
    }
}

/// Mean pass and fail rates per time bucket or per bulk id, in ascending
/// bucket order. Rows without a usable bucket key are skipped and counted.
pub fn aggregate(table: &YieldTable, granularity: Granularity) -> AggregateTable {
    let mut grouped: BTreeMap<Category, Vec<&YieldRecord>> = BTreeMap::new();
    let mut excluded_rows = 0;

    for row in &table.rows {
        match Category::of(row, granularity) {
            Some(category) => grouped.entry(category).or_default().push(row),
            None => excluded_rows += 1,
        }
    }

    if excluded_rows > 0 {
        debug!(
            granularity = %granularity,
            excluded = excluded_rows,
            "rows without a bucket key were left out of the aggregate"
        );
    }

    let count_based_rows = table.rows.iter().filter(|row| row.is_count_based()).count();
    if count_based_rows > 0 {
        warn!(
            rows = count_based_rows,
            "averaging raw bin counts; rows lack an effective count"
        );
    }

    let buckets = grouped
        .into_iter()
        .map(|(category, rows)| AggregateBucket {
            category: category.label(),
            row_count: rows.len(),
            pass_rate: mean(rows.iter().filter_map(|row| row.pass_rate)),
            fail_rates: table
                .fail_labels
                .iter()
                .map(|label| {
                    let rate = mean(rows.iter().filter_map(|row| row.fail_rate(label)));
                    (label.clone(), rate)
                })
                .collect(),
        })
        .collect();

    AggregateTable {
        granularity,
        buckets,
        excluded_rows,
        count_based_rows,
    }
}
