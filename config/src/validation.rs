//! # Configuration Validation
//!
//! Layered checks run before a merged configuration may become current:
//!
//! 1. hierarchy: required sources exist and every `extends` resolves
//! 2. schema: required sections exist, fields have the right types and
//!    ranges (`validator` derive rules on [`AppConfig`])
//! 3. business rules: cross-field constraints
//! 4. interpolation: no `${VAR}` reference left unresolved
//!
//! Errors abort a load; warnings are logged and reported but do not.

use crate::env::unresolved_references;
use crate::precedence::ConfigSource;
use crate::schema::AppConfig;
use errors::{ConfigError, ConfigResult};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use validator::{Validate, ValidationErrors, ValidationErrorsKind};

/// Placeholder secrets shipped in sample files.
pub const PLACEHOLDER_SECRETS: [&str; 2] = [
    "your-secret-key-change-in-production",
    "dev-secret-key-not-for-production",
];

pub const MIN_SECRET_LENGTH: usize = 32;

const LARGE_POOL: u32 = 50;
const LARGE_UPLOAD_BYTES: u64 = 100 * 1024 * 1024;

/// Outcome of validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn extend(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// `Ok(warnings)` when valid, `ConfigError::Validation` otherwise.
    pub fn into_result(self) -> ConfigResult<Vec<String>> {
        for warning in &self.warnings {
            tracing::warn!(%warning, "configuration warning");
        }
        if self.errors.is_empty() {
            Ok(self.warnings)
        } else {
            Err(ConfigError::Validation {
                violations: self.errors
            })
        }
    }
}

/// Runs every validation layer.
#[derive(Debug, Clone)]
pub struct ConfigValidator {
    required_sections: Vec<String>,
    environment: Option<String>
}

impl ConfigValidator {
    pub fn new(required_sections: Vec<String>) -> Self {
        Self {
            required_sections,
            environment: None
        }
    }

    /// Environment the configuration was loaded for. Production rules apply
    /// when either this or `system.environment` is `production`.
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn required_sections(&self) -> &[String] {
        &self.required_sections
    }

    /// Hierarchy, schema, business rules and interpolation.
    pub fn validate(
        &self,
        sources: &[ConfigSource],
        required_sources: &[&str],
        merged: &Value
    ) -> ValidationReport {
        let mut report = validate_hierarchy(sources, required_sources);
        report.extend(self.validate_config(merged));
        report
    }

    /// Every layer that only needs the merged mapping.
    pub fn validate_config(&self, merged: &Value) -> ValidationReport {
        let mut report = validate_schema(merged, &self.required_sections);
        report.extend(validate_business_rules(merged, self.environment.as_deref()));
        report.extend(validate_interpolation(merged));
        report
    }
}

pub fn validate_hierarchy(sources: &[ConfigSource], required: &[&str]) -> ValidationReport {
    let mut report = ValidationReport::default();
    let names: HashSet<&str> = sources.iter().map(|s| s.name.as_str()).collect();

    for name in required {
        if !names.contains(name) {
            report.error(format!("required source '{name}' is missing"));
        }
    }
    for source in sources {
        for parent in source.extends() {
            if !names.contains(parent.as_str()) {
                report.error(format!(
                    "source '{}' extends unknown source '{parent}'",
                    source.name
                ));
            }
        }
    }
    report
}

pub fn validate_schema(merged: &Value, required_sections: &[String]) -> ValidationReport {
    let mut report = ValidationReport::default();
    let Some(root) = merged.as_object() else {
        report.error("configuration root must be a mapping");
        return report;
    };

    for section in required_sections {
        match root.get(section) {
            None => report.error(format!("required section '{section}' is missing")),
            Some(Value::Object(_)) => {}
            Some(_) => report.error(format!("section '{section}' must be a mapping"))
        }
    }

    match serde_json::from_value::<AppConfig>(merged.clone()) {
        Ok(config) => {
            if let Err(errors) = config.validate() {
                let mut violations = Vec::new();
                flatten_errors("", &errors, &mut violations);
                violations.sort();
                report.errors.extend(violations);
            }
        }
        Err(e) => report.error(format!("schema: {e}"))
    }
    report
}

fn flatten_errors(prefix: &str, errors: &ValidationErrors, out: &mut Vec<String>) {
    for (field, kind) in errors.errors() {
        let path = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{prefix}.{field}")
        };
        match kind {
            ValidationErrorsKind::Field(list) => {
                for error in list {
                    let mut params: Vec<String> = error
                        .params
                        .iter()
                        .map(|(k, v)| format!("{k}={v}"))
                        .collect();
                    params.sort();
                    let detail = error
                        .message
                        .as_ref()
                        .map_or_else(|| error.code.to_string(), ToString::to_string);
                    if params.is_empty() {
                        out.push(format!("{path}: {detail}"));
                    } else {
                        out.push(format!("{path}: {detail} ({})", params.join(", ")));
                    }
                }
            }
            ValidationErrorsKind::Struct(inner) => flatten_errors(&path, inner, out),
            ValidationErrorsKind::List(items) => {
                for (idx, inner) in items {
                    flatten_errors(&format!("{path}[{idx}]"), inner, out);
                }
            }
        }
    }
}

/// Cross-field rules. Sections that fail to parse are left to the schema
/// layer. `environment` is the name the configuration was loaded for.
pub fn validate_business_rules(merged: &Value, environment: Option<&str>) -> ValidationReport {
    let mut report = ValidationReport::default();
    let Ok(config) = serde_json::from_value::<AppConfig>(merged.clone()) else {
        return report;
    };
    let production = environment == Some("production")
        || config
            .system
            .as_ref()
            .is_some_and(|s| s.environment == "production");

    if production && config.system.as_ref().is_some_and(|s| s.debug) {
        report.error("system.debug must be disabled in production");
    }

    if let Some(security) = &config.security {
        if security.secret_key.chars().count() < MIN_SECRET_LENGTH {
            report.error(format!(
                "security.secret_key must be at least {MIN_SECRET_LENGTH} characters"
            ));
        }
        if PLACEHOLDER_SECRETS.contains(&security.secret_key.as_str()) {
            report.error("security.secret_key must not be a placeholder value");
        }
    }

    if let Some(storage) = &config.storage {
        if storage.kind.as_deref() == Some("local") && storage.local_path.trim().is_empty() {
            report.error("storage.local_path is required for local storage");
        }
    }

    if let Some(ai) = &config.ai_service {
        if ai.enabled && ai.model.trim().is_empty() {
            report.error("ai_service.model is required when ai_service is enabled");
        }
    }

    if let Some(db) = &config.database {
        if db.pool_size > LARGE_POOL {
            report.warning(format!(
                "database.pool_size {} is above {LARGE_POOL}",
                db.pool_size
            ));
        }
    }
    if let Some(api) = &config.api {
        if production && api.cors_origins == ["*"] {
            report.warning("api.cors_origins allows every origin in production");
        }
    }
    if let Some(docs) = &config.document_processor {
        if docs.max_file_size > LARGE_UPLOAD_BYTES {
            report.warning("document_processor.max_file_size is above 100 MiB");
        }
    }
    if let Some(crawler) = &config.web_crawler {
        if crawler.delay < 1.0 {
            report.warning("web_crawler.delay below 1 second may overload target sites");
        }
    }
    report
}

pub fn validate_interpolation(merged: &Value) -> ValidationReport {
    let mut report = ValidationReport::default();
    for (path, var) in unresolved_references(merged) {
        report.error(format!("{path}: environment variable '{var}' is not set"));
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::precedence::SourceTier;
    use serde_json::json;

    fn source(name: &str, value: Value) -> ConfigSource {
        let Value::Object(mapping) = value else {
            panic!("fixture must be a mapping");
        };
        ConfigSource::new(name, SourceTier::Default, mapping)
    }

    fn validator() -> ConfigValidator {
        ConfigValidator::new(vec!["system".to_string()])
    }

    #[test]
    fn test_hierarchy_requires_default_and_environment() {
        let sources = vec![source("default", json!({}))];
        let report = validate_hierarchy(&sources, &["default", "production"]);
        assert_eq!(report.errors, vec!["required source 'production' is missing".to_string()]);
    }

    #[test]
    fn test_hierarchy_checks_extends() {
        let sources = vec![
            source("default", json!({})),
            source("web.template", json!({"extends": "base.template"})),
        ];
        let report = validate_hierarchy(&sources, &["default"]);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("base.template"));
    }

    #[test]
    fn test_schema_required_section() {
        let report = validate_schema(&json!({"api": {}}), &["system".to_string()]);
        assert_eq!(report.errors, vec!["required section 'system' is missing".to_string()]);

        let report = validate_schema(&json!({"system": 5}), &["system".to_string()]);
        assert!(!report.is_valid());
    }

    #[test]
    fn test_schema_flattens_nested_errors() {
        let report = validate_schema(
            &json!({"system": {"name": "x"}, "database": {"port": 0}}),
            &[]
        );
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("database.port: range"));
    }

    #[test]
    fn test_schema_reports_type_errors() {
        let report = validate_schema(&json!({"api": {"workers": "many"}}), &[]);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("schema:"));
    }

    #[test]
    fn test_production_debug_is_error() {
        let report = validate_business_rules(&json!({
            "system": {"name": "x", "environment": "production", "debug": true}
        }), None);
        assert_eq!(report.errors, vec!["system.debug must be disabled in production".to_string()]);
    }

    #[test]
    fn test_production_debug_uses_load_environment() {
        let merged = json!({"system": {"name": "x", "debug": true}});
        assert!(validate_business_rules(&merged, None).is_valid());
        assert!(validate_business_rules(&merged, Some("development")).is_valid());

        let report = validate_business_rules(&merged, Some("production"));
        assert_eq!(report.errors, vec!["system.debug must be disabled in production".to_string()]);

        let strict = validator().with_environment("production");
        assert!(!strict.validate_config(&merged).is_valid());
    }

    #[test]
    fn test_secret_rules() {
        let short = validate_business_rules(&json!({"security": {"secret_key": "short"}}), None);
        assert_eq!(short.errors.len(), 1);

        let placeholder = validate_business_rules(&json!({
            "security": {"secret_key": "your-secret-key-change-in-production"}
        }), None);
        assert_eq!(placeholder.errors.len(), 1);
        assert!(placeholder.errors[0].contains("placeholder"));

        let good = validate_business_rules(&json!({
            "security": {"secret_key": "0123456789abcdef0123456789abcdef"}
        }), None);
        assert!(good.is_valid());
    }

    #[test]
    fn test_storage_and_ai_rules() {
        let report = validate_business_rules(&json!({
            "storage": {"type": "local"},
            "ai_service": {"enabled": true}
        }), None);
        assert_eq!(report.errors.len(), 2);

        let s3 = validate_business_rules(&json!({"storage": {"type": "s3"}}), None);
        assert!(s3.is_valid());
    }

    #[test]
    fn test_warnings_do_not_fail() {
        let report = validate_business_rules(&json!({
            "system": {"name": "x", "environment": "production"},
            "database": {"pool_size": 80},
            "api": {"cors_origins": ["*"]},
            "document_processor": {"max_file_size": 209715200u64},
            "web_crawler": {"delay": 0.5}
        }), None);
        assert!(report.is_valid());
        assert_eq!(report.warnings.len(), 4);
        assert!(report.into_result().is_ok());
    }

    #[test]
    fn test_unresolved_reference_is_error() {
        let err = validator()
            .validate_config(&json!({"system": {"name": "${APP_NAME}"}}))
            .into_result()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Validation { ref violations } if violations[0].contains("APP_NAME")));
    }

    #[test]
    fn test_full_validation_passes() {
        let sources = vec![
            source("default", json!({"system": {"name": "x"}})),
            source("development", json!({"system": {"debug": true}})),
        ];
        let merged = json!({"system": {"name": "x", "debug": true}});
        let report = validator().validate(&sources, &["default", "development"], &merged);
        assert!(report.is_valid(), "{:?}", report.errors);
    }
}
