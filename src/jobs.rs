//! Ingestion job definitions.
//!
//! A [`JobSpec`] carries everything that differs between ingestion jobs:
//! destination, default sheet and header dictionary, conflict key, optional
//! foreign key, column set policy, strictness and the DDL extras applied
//! when the table is created. The three built-in jobs are `sites`, `swo`
//! and `trb`; further dependent jobs can be described in YAML.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs::File,
    io::BufReader,
    path::Path,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
    coerce::Strictness,
    columns::HeaderDictionary,
    error::IngestError,
    input::SheetSelector,
    schema::{
        CheckDef, ColumnDef, ForeignKeyDef, IndexDef, IndexMethod, SqlType, TableName, index_name,
    },
};

pub const DEFAULT_SCHEMA: &str = "public";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnSet {
    /// Every surviving input column is written, typed by inference unless
    /// pinned.
    Open,
    /// Only declared columns are written; the table is created with the full
    /// declared set.
    Declared,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredColumn {
    pub name: String,
    pub sql_type: SqlType,
    pub not_null: bool,
    /// Stored generated expression, used when the server supports it.
    pub generated: Option<String>,
    /// Check attached instead when the column has to be stored plainly.
    pub fallback_check: Option<CheckDef>,
}

impl DeclaredColumn {
    pub fn new(name: &str, sql_type: SqlType, not_null: bool) -> Self {
        Self {
            name: name.to_string(),
            sql_type,
            not_null,
            generated: None,
            fallback_check: None,
        }
    }

    pub fn to_column_def(&self) -> ColumnDef {
        ColumnDef {
            name: self.name.clone(),
            sql_type: self.sql_type.clone(),
            not_null: self.not_null,
            generated: self.generated.clone(),
        }
    }
}

/// Column computed by the pipeline from another coerced column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Derivation {
    /// Whole seconds of a duration column.
    SecondsOf { source: String, target: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub name: String,
    pub table: TableName,
    pub sheet: SheetSelector,
    pub dictionary: HeaderDictionary,
    pub conflict_column: String,
    pub foreign_key: Option<ForeignKeyDef>,
    pub column_set: ColumnSet,
    /// Full declared set, or pinned types within an open set.
    pub columns: Vec<DeclaredColumn>,
    pub required: Vec<String>,
    pub strictness: Strictness,
    pub column_strictness: BTreeMap<String, Strictness>,
    pub checks: Vec<CheckDef>,
    /// `(column, method)`; names are derived from the table name.
    pub indexes: Vec<(String, IndexMethod)>,
    pub derived: Vec<Derivation>,
}

impl JobSpec {
    pub fn sites() -> JobSpec {
        let mut columns = SITES_COLUMNS
            .iter()
            .map(|(name, ty, not_null)| DeclaredColumn::new(name, ty.clone(), *not_null))
            .collect::<Vec<_>>();
        let mut ert_seconds = DeclaredColumn::new("ert_seconds", SqlType::Integer, false);
        ert_seconds.generated = Some("CAST(EXTRACT(epoch FROM ert) AS integer)".to_string());
        ert_seconds.fallback_check = Some(check(
            "chk_ert_seconds_nonneg",
            "ert_seconds IS NULL OR ert_seconds >= 0",
        ));
        columns.push(ert_seconds);

        JobSpec {
            name: "sites".to_string(),
            table: TableName::new(DEFAULT_SCHEMA, "sites"),
            sheet: SheetSelector::Index(0),
            dictionary: HeaderDictionary::default(),
            conflict_column: "hts_site_id".to_string(),
            foreign_key: None,
            column_set: ColumnSet::Declared,
            columns,
            required: SITES_REQUIRED.iter().map(|c| c.to_string()).collect(),
            strictness: Strictness::Strict,
            column_strictness: BTreeMap::from([("ert".to_string(), Strictness::Strict)]),
            checks: vec![
                check("chk_lat", "latitude >= -90 AND latitude <= 90"),
                check("chk_lon", "longitude >= -180 AND longitude <= 180"),
                check("chk_ert_nonneg", "EXTRACT(epoch FROM ert) >= 0"),
            ],
            indexes: vec![
                ("geom".to_string(), IndexMethod::Gist),
                ("site_id".to_string(), IndexMethod::Btree),
                ("class".to_string(), IndexMethod::Btree),
                ("zone".to_string(), IndexMethod::Btree),
                ("ert_seconds".to_string(), IndexMethod::Btree),
                ("site_name".to_string(), IndexMethod::Trigram),
            ],
            derived: vec![Derivation::SecondsOf {
                source: "ert".to_string(),
                target: "ert_seconds".to_string(),
            }],
        }
    }

    pub fn swo() -> JobSpec {
        Self::work_order(
            "swo",
            "SWO",
            &[
                ("# SWO", "swo"),
                ("SWO", "swo"),
                ("SW0", "swo"),
                ("SWO ID", "swo"),
                ("Site", "hts_sn_id"),
                ("SITE", "hts_sn_id"),
            ],
        )
    }

    pub fn trb() -> JobSpec {
        Self::work_order(
            "trb",
            "TRB",
            &[
                ("#TRB", "trb"),
                ("TRB", "trb"),
                ("HTSN ID", "hts_sn_id"),
                ("HTS_SN_ID", "hts_sn_id"),
            ],
        )
    }

    /// Dependent table keyed on `key`, referencing `public.sites`.
    fn work_order(key: &str, sheet: &str, dictionary: &[(&str, &str)]) -> JobSpec {
        JobSpec {
            name: key.to_string(),
            table: TableName::new(DEFAULT_SCHEMA, key),
            sheet: SheetSelector::Name(sheet.to_string()),
            dictionary: dictionary.iter().copied().collect(),
            conflict_column: key.to_string(),
            foreign_key: Some(sites_reference("hts_sn_id")),
            column_set: ColumnSet::Open,
            columns: vec![
                DeclaredColumn::new(key, SqlType::Text, true),
                DeclaredColumn::new("hts_sn_id", SqlType::Varchar(8), true),
            ],
            required: vec![key.to_string(), "hts_sn_id".to_string()],
            strictness: Strictness::Lenient,
            column_strictness: BTreeMap::new(),
            checks: Vec::new(),
            indexes: Vec::new(),
            derived: Vec::new(),
        }
    }

    /// Loads a dependent job described in YAML.
    pub fn load(path: &Path) -> Result<JobSpec> {
        let file =
            File::open(path).with_context(|| format!("Opening job definition {path:?}"))?;
        let definition: JobDefinition = serde_yaml::from_reader(BufReader::new(file))
            .with_context(|| format!("Parsing job definition {path:?}"))?;
        definition
            .into_spec()
            .with_context(|| format!("Validating job definition {path:?}"))
    }

    pub fn declared(&self, column: &str) -> Option<&DeclaredColumn> {
        self.columns.iter().find(|c| c.name == column)
    }

    /// Per-column setting, then the run-wide override, then the job default.
    pub fn strictness_for(&self, column: &str, run_override: Option<Strictness>) -> Strictness {
        self.column_strictness
            .get(column)
            .copied()
            .or(run_override)
            .unwrap_or(self.strictness)
    }

    /// Columns that must be present after header normalization.
    pub fn required_columns(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut required = Vec::new();
        let keys = std::iter::once(&self.conflict_column)
            .chain(self.foreign_key.as_ref().map(|fk| &fk.column))
            .chain(self.required.iter());
        for column in keys {
            if seen.insert(column.clone()) {
                required.push(column.clone());
            }
        }
        required
    }

    pub fn index_defs(&self) -> Vec<IndexDef> {
        self.indexes
            .iter()
            .map(|(column, method)| IndexDef {
                name: index_name(&self.table.name, column, *method),
                column: column.clone(),
                method: *method,
            })
            .collect()
    }
}

fn check(name: &str, expression: &str) -> CheckDef {
    CheckDef {
        name: name.to_string(),
        expression: expression.to_string(),
    }
}

fn sites_reference(column: &str) -> ForeignKeyDef {
    ForeignKeyDef {
        column: column.to_string(),
        references: TableName::new(DEFAULT_SCHEMA, "sites"),
        referenced_column: "hts_site_id".to_string(),
    }
}

fn default_schema() -> String {
    DEFAULT_SCHEMA.to_string()
}

fn default_key_type() -> SqlType {
    SqlType::Text
}

fn default_reference_type() -> SqlType {
    SqlType::Varchar(8)
}

/// YAML form of a dependent job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobDefinition {
    pub name: String,
    #[serde(default = "default_schema")]
    pub schema: String,
    pub table: String,
    #[serde(default)]
    pub sheet: Option<String>,
    pub conflict_column: String,
    #[serde(default = "default_key_type")]
    pub conflict_type: SqlType,
    #[serde(default)]
    pub foreign_key: Option<ForeignKeyDefinition>,
    #[serde(default)]
    pub dictionary: BTreeMap<String, String>,
    #[serde(default)]
    pub column_types: BTreeMap<String, SqlType>,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub strictness: Strictness,
    #[serde(default)]
    pub column_strictness: BTreeMap<String, Strictness>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForeignKeyDefinition {
    pub column: String,
    #[serde(default = "default_reference_type")]
    pub column_type: SqlType,
    #[serde(default = "default_schema")]
    pub references_schema: String,
    pub references_table: String,
    pub references_column: String,
}

impl JobDefinition {
    pub fn into_spec(self) -> Result<JobSpec, IngestError> {
        for (label, value) in [
            ("name", &self.name),
            ("table", &self.table),
            ("conflict_column", &self.conflict_column),
        ] {
            if value.trim().is_empty() {
                return Err(IngestError::InvalidOption(format!(
                    "job definition field '{label}' must not be empty"
                )));
            }
        }

        let mut columns = vec![DeclaredColumn::new(
            &self.conflict_column,
            self.conflict_type.clone(),
            true,
        )];
        let foreign_key = self.foreign_key.map(|fk| {
            columns.push(DeclaredColumn::new(&fk.column, fk.column_type.clone(), true));
            ForeignKeyDef {
                column: fk.column,
                references: TableName::new(fk.references_schema, fk.references_table),
                referenced_column: fk.references_column,
            }
        });
        for (name, sql_type) in self.column_types {
            if columns.iter().any(|c| c.name == name) {
                return Err(IngestError::InvalidOption(format!(
                    "column '{name}' is a key column; its type is set by the key definition"
                )));
            }
            columns.push(DeclaredColumn::new(&name, sql_type, false));
        }

        Ok(JobSpec {
            name: self.name,
            table: TableName::new(self.schema, self.table),
            sheet: self
                .sheet
                .map(|s| match s.parse::<SheetSelector>() {
                    Ok(selector) => selector,
                    Err(never) => match never {},
                })
                .unwrap_or(SheetSelector::Index(0)),
            dictionary: self.dictionary.into_iter().collect(),
            conflict_column: self.conflict_column,
            foreign_key,
            column_set: ColumnSet::Open,
            columns,
            required: self.required,
            strictness: self.strictness,
            column_strictness: self.column_strictness,
            checks: Vec::new(),
            indexes: Vec::new(),
            derived: Vec::new(),
        })
    }
}

/// Business columns that may not be absent from a sites export.
pub const SITES_REQUIRED: &[&str] = &[
    "hts_site_id", "site_id", "site_name", "class", "ert", "ert_sec", "latitude", "longitude",
    "province", "is_under_maintenance", "pm_frequency", "pm_cluster", "cm_cluster", "fe_pm1", "fs",
    "zm", "zone", "has_genset", "energie", "rut", "teltonika", "spa", "is_in_rtmc", "type",
    "typologie", "type_pylone", "tower_height", "dependency_count", "is_colocation",
    "tenant_count", "tenant", "b2b", "numero_compteur", "type_redresseur", "nbre_module",
    "module1", "module2", "has_solar", "has_surge_protector", "etat_parafoudre",
];

/// Declared sites columns in table order; `ert_seconds` is appended
/// separately since it may be generated.
const SITES_COLUMNS: &[(&str, SqlType, bool)] = &[
    ("hts_site_id", SqlType::Varchar(8), true),
    ("site_id", SqlType::Varchar(6), true),
    ("site_name", SqlType::Varchar(64), true),
    ("class", SqlType::Varchar(32), true),
    ("ert", SqlType::Interval, true),
    ("ert_sec", SqlType::Integer, true),
    ("latitude", SqlType::DoublePrecision, true),
    ("longitude", SqlType::DoublePrecision, true),
    ("province", SqlType::Varchar(64), true),
    ("is_under_maintenance", SqlType::Boolean, true),
    ("pm_frequency", SqlType::Varchar(16), true),
    ("pm_cluster", SqlType::Varchar(64), true),
    ("cm_cluster", SqlType::Varchar(64), true),
    ("fe_pm1", SqlType::Varchar(64), true),
    ("fe_pm2", SqlType::Varchar(64), false),
    ("fe_cm1", SqlType::Varchar(64), true),
    ("fe_cm2", SqlType::Varchar(64), false),
    ("fs", SqlType::Varchar(64), true),
    ("zm", SqlType::Varchar(64), true),
    ("zone", SqlType::Varchar(8), true),
    ("has_genset", SqlType::Boolean, true),
    ("genset_brand", SqlType::Varchar(32), false),
    ("genset_serial_number", SqlType::Varchar(32), false),
    ("genset_capacity", SqlType::Varchar(8), false),
    ("genset_description", SqlType::Varchar(32), false),
    ("engine_brand", SqlType::Varchar(32), false),
    ("engine_serial_number", SqlType::Varchar(32), false),
    ("carte_controlle", SqlType::Varchar(32), false),
    ("tank_capacity", SqlType::DoublePrecision, false),
    ("genset_battery", SqlType::Varchar(32), false),
    ("filtre_huile", SqlType::Varchar(16), false),
    ("filtre_carburant", SqlType::Varchar(16), false),
    ("filtre_air", SqlType::Varchar(16), false),
    ("energie", SqlType::Varchar(24), true),
    ("rut", SqlType::Varchar(16), true),
    ("teltonika", SqlType::Varchar(16), true),
    ("spa", SqlType::Integer, true),
    ("is_in_rtmc", SqlType::Boolean, true),
    ("type", SqlType::Varchar(16), true),
    ("typologie", SqlType::Varchar(16), true),
    ("type_pylone", SqlType::Varchar(32), true),
    ("tower_height", SqlType::Integer, true),
    ("dependency_count", SqlType::Integer, true),
    ("is_colocation", SqlType::Boolean, true),
    ("tenant_count", SqlType::Integer, true),
    ("tenant", SqlType::Varchar(64), true),
    ("b2b", SqlType::Integer, true),
    ("numero_compteur", SqlType::Varchar(32), true),
    ("baco_porte_fusible", SqlType::Varchar(32), false),
    ("type_baco_porte_fusible", SqlType::Varchar(32), false),
    ("fuse_rating", SqlType::DoublePrecision, false),
    ("rbs_breaker_rating", SqlType::DoublePrecision, false),
    ("type_redresseur", SqlType::Varchar(32), true),
    ("nbre_module", SqlType::Varchar(100), true),
    ("module1", SqlType::Varchar(32), true),
    ("module2", SqlType::Varchar(32), true),
    ("module3", SqlType::Varchar(32), false),
    ("module4", SqlType::Varchar(32), false),
    ("module5", SqlType::Varchar(32), false),
    ("module6", SqlType::Varchar(32), false),
    ("module9", SqlType::Varchar(32), false),
    ("rectifier_power", SqlType::DoublePrecision, false),
    ("type_batterie", SqlType::Varchar(32), false),
    ("marque_batterie", SqlType::Varchar(32), false),
    ("tension_batterie", SqlType::Varchar(6), false),
    ("capacite_indiv_batt", SqlType::Varchar(8), false),
    ("capacite_totale_batt", SqlType::Varchar(8), false),
    ("battery_count", SqlType::DoublePrecision, false),
    ("charge_current", SqlType::DoublePrecision, false),
    ("statut_autonomie", SqlType::Varchar(32), false),
    ("has_solar", SqlType::Boolean, true),
    ("panel_count", SqlType::DoublePrecision, false),
    ("type_panneau", SqlType::Varchar(32), false),
    ("puissance_panneau", SqlType::DoublePrecision, false),
    ("nbre_string", SqlType::DoublePrecision, false),
    ("nbre_panneau_par_strign", SqlType::DoublePrecision, false),
    ("puiss_total_panneau", SqlType::DoublePrecision, false),
    ("type_module_solaire", SqlType::Varchar(32), false),
    ("nbre_module_solaire", SqlType::DoublePrecision, false),
    ("puiss_module_solaire", SqlType::DoublePrecision, false),
    ("puiss_totale_module_solaire", SqlType::DoublePrecision, false),
    ("has_surge_protector", SqlType::Boolean, true),
    ("etat_parafoudre", SqlType::Varchar(16), true),
    ("geom", SqlType::Geography, false),
    ("ert_interval", SqlType::Interval, false),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sites_job_declares_full_column_set() {
        let job = JobSpec::sites();
        assert_eq!(job.columns.len(), 86);
        assert_eq!(job.required.len(), 40);
        assert!(job.required.iter().all(|c| job.declared(c).is_some()));
        let ert_seconds = job.declared("ert_seconds").unwrap();
        assert!(ert_seconds.generated.is_some());
        assert!(ert_seconds.fallback_check.is_some());
        assert!(ert_seconds.to_column_def().generated.is_some());
        assert_eq!(job.strictness_for("has_genset", None), Strictness::Strict);
        assert_eq!(
            job.strictness_for("has_genset", Some(Strictness::Lenient)),
            Strictness::Lenient
        );
        assert_eq!(
            job.strictness_for("ert", Some(Strictness::Lenient)),
            Strictness::Strict
        );
    }

    #[test]
    fn sites_index_names_follow_table() {
        let names = JobSpec::sites()
            .index_defs()
            .into_iter()
            .map(|idx| idx.name)
            .collect::<Vec<_>>();
        assert!(names.contains(&"sites_geom_gist".to_string()));
        assert!(names.contains(&"sites_site_name_trgm_idx".to_string()));
        assert!(names.contains(&"sites_ert_seconds_idx".to_string()));
    }

    #[test]
    fn work_order_jobs_require_both_keys() {
        let swo = JobSpec::swo();
        assert_eq!(swo.required_columns(), vec!["swo", "hts_sn_id"]);
        assert_eq!(swo.dictionary.lookup("SW0"), Some("swo"));
        assert_eq!(swo.sheet, SheetSelector::Name("SWO".into()));
        let trb = JobSpec::trb();
        assert_eq!(trb.dictionary.lookup("HTSN ID"), Some("hts_sn_id"));
        assert_eq!(trb.strictness_for("anything", None), Strictness::Lenient);
    }

    #[test]
    fn yaml_definitions_become_open_jobs() {
        let yaml = r##"
name: pmwo
table: pmwo
sheet: "1"
conflict_column: pmwo
foreign_key:
  column: hts_sn_id
  references_table: sites
  references_column: hts_site_id
dictionary:
  "# PMWO": pmwo
column_types:
  planned_on: timestamp
strictness: strict
"##;
        let definition: JobDefinition = serde_yaml::from_str(yaml).unwrap();
        let job = definition.into_spec().unwrap();
        assert_eq!(job.table, TableName::new("public", "pmwo"));
        assert_eq!(job.sheet, SheetSelector::Index(1));
        assert_eq!(job.column_set, ColumnSet::Open);
        assert_eq!(job.declared("hts_sn_id").unwrap().sql_type, SqlType::Varchar(8));
        assert_eq!(job.declared("planned_on").unwrap().sql_type, SqlType::Timestamp);
        assert_eq!(job.required_columns(), vec!["pmwo", "hts_sn_id"]);
        assert_eq!(job.strictness, Strictness::Strict);
    }

    #[test]
    fn yaml_rejects_retyping_key_columns() {
        let yaml = "name: x\ntable: x\nconflict_column: id\ncolumn_types:\n  id: integer\n";
        let definition: JobDefinition = serde_yaml::from_str(yaml).unwrap();
        assert!(definition.into_spec().is_err());
    }
}
