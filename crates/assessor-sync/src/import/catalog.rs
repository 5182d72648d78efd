//! Entity catalog: per-entity file format and field mappings
//!
//! The catalog is a tagged TOML document, validated once when loaded.
//! Nothing is parsed with a catalog that failed validation.
//!
//! ```toml
//! [[entity]]
//! name = "property"
//! key_field = "propertyId"
//! keywords = ["property", "parcel"]
//!
//! [entity.format]
//! kind = "delimited"
//! delimiter = ","
//! has_header = false
//! columns = 7
//!
//! [[entity.mapping]]
//! source = 0
//! target = "propertyId"
//! type = "string"
//! required = true
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use super::value::{FieldType, Transform};
use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelimitedConfig {
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default)]
    pub has_header: bool,
    /// Expected column count; rows with another count are malformed.
    /// Defaults to the header width when a header is present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<usize>,
}

fn default_delimiter() -> char {
    ','
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedWidthField {
    pub name: String,
    /// Zero-based character offset
    pub start: usize,
    pub length: usize,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub field_type: Option<FieldType>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedWidthConfig {
    pub fields: Vec<FixedWidthField>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FormatConfig {
    Delimited(DelimitedConfig),
    FixedWidth(FixedWidthConfig),
}

/// Where a mapped value comes from: a zero-based column or a named field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldSource {
    Position(usize),
    Name(String),
}

impl std::fmt::Display for FieldSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldSource::Position(i) => write!(f, "column {}", i),
            FieldSource::Name(name) => write!(f, "'{}'", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub source: FieldSource,
    pub target: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub field_type: Option<FieldType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Transform>,
    #[serde(default)]
    pub required: bool,
}

impl FieldMapping {
    fn new(source: FieldSource, target: &str, field_type: FieldType) -> Self {
        Self {
            source,
            target: target.to_string(),
            field_type: Some(field_type),
            transform: None,
            required: false,
        }
    }

    fn required(mut self) -> Self {
        self.required = true;
        self
    }

    fn transform(mut self, transform: Transform) -> Self {
        self.transform = Some(transform);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySpec {
    pub name: String,
    /// Mapped target whose value identifies a production record
    pub key_field: String,
    /// File name fragments that select this entity
    #[serde(default)]
    pub keywords: Vec<String>,
    pub format: FormatConfig,
    #[serde(rename = "mapping")]
    pub mappings: Vec<FieldMapping>,
}

impl EntitySpec {
    fn validate(&self) -> SyncResult<()> {
        let fail = |msg: String| -> SyncResult<()> {
            Err(SyncError::config(format!("entity '{}': {}", self.name, msg)))
        };

        if self.name.trim().is_empty() {
            return Err(SyncError::config("entity with empty name"));
        }
        if self.mappings.is_empty() {
            return fail("no field mappings".into());
        }

        let mut targets = HashSet::new();
        for mapping in &self.mappings {
            if mapping.target.trim().is_empty() {
                return fail("mapping with empty target".into());
            }
            if !targets.insert(mapping.target.as_str()) {
                return fail(format!("target field '{}' mapped more than once", mapping.target));
            }
        }
        if !targets.contains(self.key_field.as_str()) {
            return fail(format!("key field '{}' is not a mapping target", self.key_field));
        }

        match &self.format {
            FormatConfig::Delimited(config) => {
                if !config.delimiter.is_ascii() || config.delimiter == '"' || config.delimiter == '\n' {
                    return fail(format!("unsupported delimiter {:?}", config.delimiter));
                }
                for mapping in &self.mappings {
                    match &mapping.source {
                        FieldSource::Name(name) if !config.has_header => {
                            return fail(format!(
                                "mapping '{}' uses named source '{}' but the format has no header",
                                mapping.target, name
                            ));
                        },
                        FieldSource::Position(i) => {
                            if let Some(columns) = config.columns {
                                if *i >= columns {
                                    return fail(format!(
                                        "mapping '{}' reads column {} of {}",
                                        mapping.target, i, columns
                                    ));
                                }
                            }
                        },
                        FieldSource::Name(_) => {},
                    }
                }
            },
            FormatConfig::FixedWidth(config) => {
                if config.fields.is_empty() {
                    return fail("fixed-width format without fields".into());
                }
                let mut names = HashSet::new();
                for field in &config.fields {
                    if field.length == 0 {
                        return fail(format!("fixed-width field '{}' has zero length", field.name));
                    }
                    if !names.insert(field.name.as_str()) {
                        return fail(format!("fixed-width field '{}' defined twice", field.name));
                    }
                }
                for mapping in &self.mappings {
                    let known = match &mapping.source {
                        FieldSource::Name(name) => names.contains(name.as_str()),
                        FieldSource::Position(i) => *i < config.fields.len(),
                    };
                    if !known {
                        return fail(format!(
                            "mapping '{}' reads unknown fixed-width field {}",
                            mapping.target, mapping.source
                        ));
                    }
                }
            },
        }
        Ok(())
    }

    /// Type of a mapping: explicit, else the fixed-width field's, else string
    pub fn field_type(&self, mapping: &FieldMapping) -> FieldType {
        if let Some(field_type) = mapping.field_type {
            return field_type;
        }
        if let FormatConfig::FixedWidth(config) = &self.format {
            let field = match &mapping.source {
                FieldSource::Name(name) => config.fields.iter().find(|f| &f.name == name),
                FieldSource::Position(i) => config.fields.get(*i),
            };
            if let Some(field_type) = field.and_then(|f| f.field_type) {
                return field_type;
            }
        }
        FieldType::String
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct CatalogDocument {
    entity: Vec<EntitySpec>,
}

/// Validated set of entity specifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityCatalog {
    entities: Vec<EntitySpec>,
}

impl EntityCatalog {
    pub fn new(entities: Vec<EntitySpec>) -> SyncResult<Self> {
        let catalog = Self { entities };
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn from_toml_str(source: &str) -> SyncResult<Self> {
        let document: CatalogDocument = toml::from_str(source)
            .map_err(|e| SyncError::config(format!("invalid entity catalog: {}", e)))?;
        Self::new(document.entity)
    }

    pub fn load(path: &Path) -> SyncResult<Self> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            SyncError::config(format!("cannot read entity catalog {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&source)
    }

    pub fn to_toml_string(&self) -> SyncResult<String> {
        toml::to_string_pretty(&CatalogDocument {
            entity: self.entities.clone(),
        })
        .map_err(|e| SyncError::config(format!("cannot encode entity catalog: {}", e)))
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.entities.is_empty() {
            return Err(SyncError::config("entity catalog is empty"));
        }
        let mut names = HashSet::new();
        for entity in &self.entities {
            entity.validate()?;
            if !names.insert(entity.name.as_str()) {
                return Err(SyncError::config(format!("entity '{}' defined twice", entity.name)));
            }
        }
        Ok(())
    }

    pub fn entities(&self) -> &[EntitySpec] {
        &self.entities
    }

    pub fn get(&self, name: &str) -> Option<&EntitySpec> {
        self.entities.iter().find(|e| e.name.eq_ignore_ascii_case(name))
    }

    /// First entity, in catalog order, with a keyword in `file_name`
    pub fn detect(&self, file_name: &str) -> Option<&EntitySpec> {
        let lower = file_name.to_lowercase();
        self.entities.iter().find(|entity| {
            entity
                .keywords
                .iter()
                .any(|k| lower.contains(&k.to_lowercase()))
        })
    }

    /// Catalog for the county's standard exports
    ///
    /// Specific entities come first so detection prefers them over the
    /// generic property export.
    pub fn builtin() -> Self {
        use FieldSource::{Name, Position};

        let land = EntitySpec {
            name: "land".into(),
            key_field: "landId".into(),
            keywords: vec!["land".into()],
            format: FormatConfig::FixedWidth(FixedWidthConfig {
                fields: vec![
                    fixed("land_id", 0, 10, FieldType::String),
                    fixed("parcel_number", 10, 12, FieldType::String),
                    fixed("land_type", 22, 10, FieldType::String),
                    fixed("acres", 32, 10, FieldType::Decimal),
                    fixed("land_value", 42, 12, FieldType::Number),
                ],
            }),
            mappings: vec![
                FieldMapping::new(Name("land_id".into()), "landId", FieldType::String).required(),
                FieldMapping::new(Name("parcel_number".into()), "parcelNumber", FieldType::String)
                    .required(),
                FieldMapping::new(Name("land_type".into()), "landType", FieldType::String)
                    .transform(Transform::Lowercase),
                FieldMapping::new(Name("acres".into()), "acres", FieldType::Decimal),
                FieldMapping::new(Name("land_value".into()), "value", FieldType::Number),
            ],
        };

        let improvement = EntitySpec {
            name: "improvement".into(),
            key_field: "improvementId".into(),
            keywords: vec!["improvement".into(), "building".into()],
            format: FormatConfig::Delimited(DelimitedConfig {
                delimiter: ',',
                has_header: true,
                columns: None,
            }),
            mappings: vec![
                FieldMapping::new(Name("improvement_id".into()), "improvementId", FieldType::String)
                    .required(),
                FieldMapping::new(Name("parcel_number".into()), "parcelNumber", FieldType::String)
                    .required(),
                FieldMapping::new(Name("description".into()), "description", FieldType::String)
                    .transform(Transform::Trim),
                FieldMapping::new(Name("year_built".into()), "yearBuilt", FieldType::Integer),
                FieldMapping::new(Name("square_feet".into()), "squareFeet", FieldType::Integer),
                FieldMapping::new(Name("improvement_value".into()), "value", FieldType::Number),
            ],
        };

        let property = EntitySpec {
            name: "property".into(),
            key_field: "propertyId".into(),
            keywords: vec![
                "property".into(),
                "parcel".into(),
                "assessment".into(),
                "tax".into(),
            ],
            format: FormatConfig::Delimited(DelimitedConfig {
                delimiter: ',',
                has_header: false,
                columns: Some(7),
            }),
            mappings: vec![
                FieldMapping::new(Position(0), "propertyId", FieldType::String).required(),
                FieldMapping::new(Position(1), "address", FieldType::String),
                FieldMapping::new(Position(2), "parcelNumber", FieldType::String).required(),
                FieldMapping::new(Position(3), "propertyType", FieldType::String),
                FieldMapping::new(Position(4), "status", FieldType::String),
                FieldMapping::new(Position(5), "acres", FieldType::Decimal),
                FieldMapping::new(Position(6), "value", FieldType::Number),
            ],
        };

        Self {
            entities: vec![land, improvement, property],
        }
    }
}

fn fixed(name: &str, start: usize, length: usize, field_type: FieldType) -> FixedWidthField {
    FixedWidthField {
        name: name.to_string(),
        start,
        length,
        field_type: Some(field_type),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"
        [[entity]]
        name = "sale"
        key_field = "saleId"
        keywords = ["sales"]

        [entity.format]
        kind = "delimited"
        delimiter = "|"
        has_header = true

        [[entity.mapping]]
        source = "SALE_ID"
        target = "saleId"
        required = true

        [[entity.mapping]]
        source = "PRICE"
        target = "price"
        type = "number"

        [[entity]]
        name = "zoning"
        key_field = "zoneCode"

        [entity.format]
        kind = "fixed_width"
        fields = [
            { name = "code", start = 0, length = 4 },
            { name = "area", start = 4, length = 8, type = "decimal" },
        ]

        [[entity.mapping]]
        source = "code"
        target = "zoneCode"
        transform = "uppercase"

        [[entity.mapping]]
        source = 1
        target = "area"
    "#;

    #[test]
    fn test_builtin_catalog_is_valid() {
        let catalog = EntityCatalog::builtin();
        assert!(catalog.validate().is_ok());
        assert_eq!(catalog.entities().len(), 3);
    }

    #[test]
    fn test_toml_catalog_loads() {
        let catalog = EntityCatalog::from_toml_str(CATALOG).unwrap();
        let sale = catalog.get("sale").unwrap();
        assert!(matches!(&sale.format, FormatConfig::Delimited(c) if c.delimiter == '|' && c.has_header));
        assert_eq!(sale.mappings[0].source, FieldSource::Name("SALE_ID".into()));

        let zoning = catalog.get("ZONING").unwrap();
        assert_eq!(zoning.mappings[1].source, FieldSource::Position(1));
        assert_eq!(zoning.field_type(&zoning.mappings[1]), FieldType::Decimal);
        assert_eq!(zoning.field_type(&zoning.mappings[0]), FieldType::String);
        assert_eq!(zoning.mappings[0].transform, Some(Transform::Uppercase));
    }

    #[test]
    fn test_builtin_round_trips_through_toml() {
        let catalog = EntityCatalog::builtin();
        let text = catalog.to_toml_string().unwrap();
        assert_eq!(EntityCatalog::from_toml_str(&text).unwrap(), catalog);
    }

    #[test]
    fn test_duplicate_targets_are_rejected() {
        let source = CATALOG.replace("target = \"price\"", "target = \"saleId\"");
        let err = EntityCatalog::from_toml_str(&source).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_named_source_without_header_is_rejected() {
        let source = CATALOG.replace("has_header = true", "has_header = false");
        let err = EntityCatalog::from_toml_str(&source).unwrap_err();
        assert!(err.to_string().contains("no header"));
    }

    #[test]
    fn test_unmapped_key_and_unknown_kind_are_rejected() {
        let source = CATALOG.replace("key_field = \"saleId\"", "key_field = \"saleNumber\"");
        assert!(EntityCatalog::from_toml_str(&source).is_err());

        let source = CATALOG.replace("kind = \"fixed_width\"", "kind = \"xml\"");
        assert!(matches!(
            EntityCatalog::from_toml_str(&source),
            Err(SyncError::Config(_))
        ));
    }

    #[test]
    fn test_detection_prefers_specific_entities() {
        let catalog = EntityCatalog::builtin();
        assert_eq!(catalog.detect("Parcel_Land_2024.txt").unwrap().name, "land");
        assert_eq!(catalog.detect("property_improvements.csv").unwrap().name, "improvement");
        assert_eq!(catalog.detect("TAX_ROLL.csv").unwrap().name, "property");
        assert!(catalog.detect("readme.csv").is_none());
    }
}
