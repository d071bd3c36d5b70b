//! CSV reports for records and organizations the importer could not place.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use roster_core::{Affiliation, DEFAULT_END, DEFAULT_START, IncomingRecord};
use time::OffsetDateTime;
use time::macros::format_description;

/// `{prefix}_{YYYYMMDDhhmmss}{nanoseconds:09}.csv`
pub fn report_path(dir: &Path, prefix: &str, now: OffsetDateTime) -> Result<PathBuf> {
    let stamp = now
        .format(format_description!(
            "[year][month][day][hour][minute][second][subsecond digits:9]"
        ))
        .context("format report timestamp")?;
    Ok(dir.join(format!("{prefix}_{stamp}.csv")))
}

fn render_aliases(record: &IncomingRecord) -> String {
    record
        .aliases
        .iter()
        .map(|(source, usernames)| format!("{source}: [{}]", usernames.join(",")))
        .collect::<Vec<_>>()
        .join(",")
}

fn render_affiliation(affiliation: &Affiliation) -> String {
    let mut out = affiliation.organization.clone();
    if affiliation.start > DEFAULT_START {
        out.push_str(&format!(" from:{}", affiliation.start));
    }
    if affiliation.end < DEFAULT_END {
        out.push_str(&format!(" to:{}", affiliation.end));
    }
    out
}

pub fn write_unresolved<W: Write>(writer: W, records: &[IncomingRecord]) -> Result<()> {
    let mut csv = csv::Writer::from_writer(writer);
    csv.write_record(["Name", "Emails", "Identities", "Enrollments"])?;
    for record in records {
        let affiliations = record
            .affiliations
            .iter()
            .map(render_affiliation)
            .collect::<Vec<_>>()
            .join(",");
        csv.write_record([
            record.profile.name.as_str(),
            record.emails.join(",").as_str(),
            render_aliases(record).as_str(),
            affiliations.as_str(),
        ])?;
    }
    csv.flush()?;
    Ok(())
}

pub fn write_missing_organizations<W: Write>(
    writer: W,
    organizations: &BTreeSet<String>,
) -> Result<()> {
    let mut csv = csv::Writer::from_writer(writer);
    csv.write_record(["Organization Name"])?;
    for name in organizations {
        csv.write_record([name.as_str()])?;
    }
    csv.flush()?;
    Ok(())
}
