use crate::error::{RecallError, Result};
use crate::models::{MetadataRecord, DOC_ID_FIELD, TIMESTAMP_FIELD};
use std::collections::BTreeSet;

/// Header row plus one value row for a single record. List elements are joined with a space.
pub fn metadata_to_csv(record: &MetadataRecord) -> Result<String> {
    let mut header = vec![DOC_ID_FIELD.to_string()];
    let mut row = vec![record.doc_id.clone()];
    for (name, value) in &record.fields {
        header.push(name.clone());
        row.push(value.flatten(" "));
    }
    if let Some(ingested_at) = record.ingested_at {
        header.push(TIMESTAMP_FIELD.to_string());
        row.push(ingested_at.to_rfc3339());
    }

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(&header)?;
    writer.write_record(&row)?;
    finish(writer)
}

/// One row per record over the union of their columns: `doc_id` first,
/// attributes sorted by name, `timestamp` last. Missing attributes are empty
/// cells and list elements are joined with `; `.
pub fn records_to_csv(records: &[MetadataRecord]) -> Result<String> {
    let columns: BTreeSet<&str> = records
        .iter()
        .flat_map(|record| record.fields.keys().map(String::as_str))
        .collect();

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(
        std::iter::once(DOC_ID_FIELD)
            .chain(columns.iter().copied())
            .chain(std::iter::once(TIMESTAMP_FIELD)),
    )?;

    for record in records {
        let mut row = vec![record.doc_id.clone()];
        row.extend(columns.iter().map(|column| {
            record
                .field(column)
                .map(|value| value.flatten("; "))
                .unwrap_or_default()
        }));
        row.push(
            record
                .ingested_at
                .map(|at| at.to_rfc3339())
                .unwrap_or_default(),
        );
        writer.write_record(&row)?;
    }

    finish(writer)
}

fn finish(writer: csv::Writer<Vec<u8>>) -> Result<String> {
    let bytes = writer
        .into_inner()
        .map_err(|error| RecallError::Io(error.into_error()))?;
    String::from_utf8(bytes).map_err(|error| RecallError::InvalidArgument(error.to_string()))
}
