//! Field mapper: raw rows to typed fields
//!
//! Coercion failures never abort mapping; they are collected on the
//! [`MappedRecord`] and make the staged record invalid.

use std::collections::BTreeMap;

use super::catalog::{EntitySpec, FieldSource, FormatConfig};
use super::parser::RawRecord;
use super::value::{FieldType, FieldValue};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappedRecord {
    pub fields: BTreeMap<String, FieldValue>,
    pub errors: Vec<String>,
}

impl MappedRecord {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Applies one entity's [`FieldMapping`](super::catalog::FieldMapping)s
pub struct FieldMapper<'a> {
    spec: &'a EntitySpec,
    /// Fixed-width values arrive padded and are always trimmed
    trim_all: bool,
}

impl<'a> FieldMapper<'a> {
    pub fn new(spec: &'a EntitySpec) -> Self {
        Self {
            spec,
            trim_all: matches!(spec.format, FormatConfig::FixedWidth(_)),
        }
    }

    pub fn spec(&self) -> &EntitySpec {
        self.spec
    }

    pub fn map(&self, record: &RawRecord) -> MappedRecord {
        let mut mapped = MappedRecord::default();

        for mapping in &self.spec.mappings {
            let raw = match &mapping.source {
                FieldSource::Position(i) => record.by_position(*i),
                FieldSource::Name(name) => record.by_name(name),
            };

            let Some(raw) = raw else {
                if mapping.required {
                    mapped.errors.push(format!(
                        "required field '{}' missing: no source {}",
                        mapping.target, mapping.source
                    ));
                } else {
                    mapped.fields.insert(mapping.target.clone(), FieldValue::Null);
                }
                continue;
            };

            let mut value = if self.trim_all {
                raw.trim().to_string()
            } else {
                raw.to_string()
            };
            if let Some(transform) = mapping.transform {
                value = transform.apply(&value);
            }

            let field_type = self.spec.field_type(mapping);
            if value.trim().is_empty() {
                if mapping.required {
                    mapped
                        .errors
                        .push(format!("required field '{}' is empty", mapping.target));
                } else {
                    mapped.fields.insert(mapping.target.clone(), FieldValue::Null);
                }
                continue;
            }

            let input = if field_type == FieldType::String {
                value.as_str()
            } else {
                value.trim()
            };
            match field_type.coerce(input) {
                Ok(typed) => {
                    mapped.fields.insert(mapping.target.clone(), typed);
                },
                Err(e) => mapped.errors.push(format!("field '{}': {}", mapping.target, e)),
            }
        }

        mapped
    }

    /// Identifying key of a mapped record
    pub fn key_of(&self, mapped: &MappedRecord) -> Option<String> {
        mapped.fields.get(&self.spec.key_field).and_then(FieldValue::as_key)
    }

    /// Raw values keyed by column name (or position for headerless files)
    pub fn raw_fields(record: &RawRecord) -> BTreeMap<String, String> {
        record
            .values
            .iter()
            .enumerate()
            .map(|(i, v)| (record.column_name(i), v.clone()))
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::import::catalog::EntityCatalog;
    use crate::import::parser::{parse, ParsedRow};
    use chrono::NaiveDate;

    fn first_record(spec: &EntitySpec, input: &str) -> RawRecord {
        match parse(input.as_bytes(), &spec.format).remove(0) {
            ParsedRow::Record(r) => r,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_property_row_maps_without_precision_loss() {
        let catalog = EntityCatalog::builtin();
        let spec = catalog.get("property").unwrap();
        let raw = first_record(spec, "BC001,123 Main St,12345,residential,active,0.25,150000\n");

        let mapper = FieldMapper::new(spec);
        let mapped = mapper.map(&raw);

        assert!(mapped.is_valid(), "{:?}", mapped.errors);
        let expected: BTreeMap<String, FieldValue> = [
            ("propertyId", FieldValue::Text("BC001".into())),
            ("address", FieldValue::Text("123 Main St".into())),
            ("parcelNumber", FieldValue::Text("12345".into())),
            ("propertyType", FieldValue::Text("residential".into())),
            ("status", FieldValue::Text("active".into())),
            ("acres", FieldValue::Decimal("0.25".parse().unwrap())),
            ("value", FieldValue::Integer(150000)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        assert_eq!(mapped.fields, expected);
        assert_eq!(mapper.key_of(&mapped), Some("BC001".to_string()));
    }

    #[test]
    fn test_coercion_failure_is_recorded_not_thrown() {
        let catalog = EntityCatalog::builtin();
        let spec = catalog.get("property").unwrap();
        let raw = first_record(spec, "BC009,1 Elm St,999,residential,active,about half,n/a\n");

        let mapped = FieldMapper::new(spec).map(&raw);
        assert_eq!(mapped.errors.len(), 2);
        assert!(mapped.errors[0].contains("acres"));
        assert!(mapped.errors[1].contains("value"));
        assert_eq!(mapped.fields.get("propertyId"), Some(&FieldValue::Text("BC009".into())));
    }

    #[test]
    fn test_required_and_optional_empty_values() {
        let catalog = EntityCatalog::builtin();
        let spec = catalog.get("property").unwrap();
        let raw = first_record(spec, ",,12345,residential,active,,\n");

        let mapped = FieldMapper::new(spec).map(&raw);
        assert_eq!(mapped.errors, vec!["required field 'propertyId' is empty".to_string()]);
        assert_eq!(mapped.fields.get("acres"), Some(&FieldValue::Null));
        assert_eq!(mapped.fields.get("address"), Some(&FieldValue::Null));
    }

    #[test]
    fn test_fixed_width_land_record() {
        let catalog = EntityCatalog::builtin();
        let spec = catalog.get("land").unwrap();
        let line = format!(
            "{:<10}{:<12}{:<10}{:>10}{:>12}\n",
            "L-100", "12345", "PASTURE", "12.5", "48000"
        );
        let raw = first_record(spec, &line);

        let mapped = FieldMapper::new(spec).map(&raw);
        assert!(mapped.is_valid(), "{:?}", mapped.errors);
        assert_eq!(mapped.fields["landId"], FieldValue::Text("L-100".into()));
        assert_eq!(mapped.fields["landType"], FieldValue::Text("pasture".into()));
        assert_eq!(mapped.fields["acres"], FieldValue::Decimal("12.5".parse().unwrap()));
        assert_eq!(mapped.fields["value"], FieldValue::Integer(48000));
    }

    #[test]
    fn test_named_columns_and_dates() {
        let catalog = EntityCatalog::from_toml_str(
            r#"
            [[entity]]
            name = "sale"
            key_field = "saleId"
            [entity.format]
            kind = "delimited"
            has_header = true
            [[entity.mapping]]
            source = "id"
            target = "saleId"
            transform = "uppercase"
            [[entity.mapping]]
            source = "sold_on"
            target = "soldOn"
            type = "date"
            [[entity.mapping]]
            source = "missing_column"
            target = "note"
            "#,
        )
        .unwrap();
        let spec = catalog.get("sale").unwrap();
        let raw = first_record(spec, "id,sold_on\ns-1,03/09/2024\n");

        let mapper = FieldMapper::new(spec);
        let mapped = mapper.map(&raw);
        assert!(mapped.is_valid());
        assert_eq!(mapped.fields["saleId"], FieldValue::Text("S-1".into()));
        assert_eq!(
            mapped.fields["soldOn"],
            FieldValue::Date(NaiveDate::from_ymd_opt(2024, 3, 9).unwrap())
        );
        assert_eq!(mapped.fields["note"], FieldValue::Null);
        assert_eq!(FieldMapper::raw_fields(&raw)["sold_on"], "03/09/2024");
    }
}
