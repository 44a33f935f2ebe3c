//! Renders a [`RemediationPlan`] to dialect-specific DDL plus cast directives.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::{
    error::{ReconcileError, Result},
    plan::{CoercionPolicy, RemediationAction, RemediationPlan},
    types::CanonicalType,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Sqlite,
    Mysql,
    Postgres,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "sqlite",
            Dialect::Mysql => "mysql",
            Dialect::Postgres => "postgres",
        }
    }

    pub fn quote_identifier(&self, identifier: &str) -> String {
        match self {
            Dialect::Mysql => format!("`{}`", identifier.replace('`', "``")),
            Dialect::Sqlite | Dialect::Postgres => {
                format!("\"{}\"", identifier.replace('"', "\"\""))
            }
        }
    }

    /// Column type declared for a canonical type. Each name maps back to the same
    /// canonical type through [`crate::types::map_raw_type`].
    pub fn type_name(&self, ty: CanonicalType) -> &'static str {
        match (self, ty) {
            (Dialect::Sqlite, CanonicalType::Integer) => "INTEGER",
            (Dialect::Sqlite, CanonicalType::Real) => "REAL",
            (Dialect::Sqlite, CanonicalType::Boolean) => "BOOLEAN",
            (Dialect::Sqlite, CanonicalType::Timestamp) => "TIMESTAMP",
            (Dialect::Mysql, CanonicalType::Integer) => "BIGINT",
            (Dialect::Mysql, CanonicalType::Real) => "DOUBLE",
            (Dialect::Mysql, CanonicalType::Boolean) => "TINYINT(1)",
            (Dialect::Mysql, CanonicalType::Timestamp) => "DATETIME",
            (Dialect::Postgres, CanonicalType::Integer) => "BIGINT",
            (Dialect::Postgres, CanonicalType::Real) => "DOUBLE PRECISION",
            (Dialect::Postgres, CanonicalType::Boolean) => "BOOLEAN",
            (Dialect::Postgres, CanonicalType::Timestamp) => "TIMESTAMP",
            (_, CanonicalType::Text) => "TEXT",
        }
    }

    /// DDL for one action; `None` for cast rules, which are not DDL.
    pub fn render_action(&self, table: &str, action: &RemediationAction) -> Result<Option<String>> {
        let table_ident = self.quote_identifier(table);
        match action {
            RemediationAction::AddColumn {
                name,
                canonical_type,
            } => Ok(Some(format!(
                "ALTER TABLE {table_ident} ADD COLUMN {} {}",
                self.quote_identifier(name),
                self.type_name(*canonical_type)
            ))),
            RemediationAction::WidenColumnType {
                name,
                from_type,
                to_type,
            } => {
                let column = self.quote_identifier(name);
                let type_name = self.type_name(*to_type);
                match self {
                    Dialect::Sqlite => Err(ReconcileError::UnsupportedStatement {
                        dialect: self.as_str().to_string(),
                        action: action.to_string(),
                    }),
                    Dialect::Mysql => Ok(Some(format!(
                        "ALTER TABLE {table_ident} MODIFY COLUMN {column} {type_name}"
                    ))),
                    Dialect::Postgres => {
                        let using = if *from_type == CanonicalType::Boolean {
                            format!("CASE WHEN {column} THEN 1 ELSE 0 END")
                        } else {
                            format!("{column}::{type_name}")
                        };
                        Ok(Some(format!(
                            "ALTER TABLE {table_ident} ALTER COLUMN {column} TYPE {type_name} USING {using}"
                        )))
                    }
                }
            }
            RemediationAction::CastRule { .. } => Ok(None),
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CastDirective {
    pub column: String,
    pub from_type: CanonicalType,
    pub to_type: CanonicalType,
    pub on_loss: CoercionPolicy,
}

impl CastDirective {
    pub fn from_action(action: &RemediationAction) -> Option<Self> {
        match action {
            RemediationAction::CastRule {
                name,
                from_type,
                to_type,
                on_loss,
            } => Some(CastDirective {
                column: name.clone(),
                from_type: *from_type,
                to_type: *to_type,
                on_loss: *on_loss,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedPlan {
    pub dialect: Dialect,
    pub table: String,
    pub statements: Vec<String>,
    pub casts: Vec<CastDirective>,
}

/// Renders every action of `plan`. Fails as a whole if the dialect cannot
/// express one of the structural actions, so no partial DDL is handed out.
pub fn render_plan(plan: &RemediationPlan, table: &str, dialect: Dialect) -> Result<RenderedPlan> {
    let mut statements = Vec::new();
    for action in plan.structural_actions() {
        if let Some(statement) = dialect.render_action(table, action)? {
            statements.push(statement);
        }
    }
    let casts = plan
        .cast_rules()
        .filter_map(CastDirective::from_action)
        .collect();
    Ok(RenderedPlan {
        dialect,
        table: table.to_string(),
        statements,
        casts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::map_raw_type;
    use CanonicalType::*;

    fn sample_plan() -> RemediationPlan {
        RemediationPlan {
            target_fingerprint: None,
            actions: vec![
                RemediationAction::WidenColumnType {
                    name: "alcohol_percentage".to_string(),
                    from_type: Integer,
                    to_type: Real,
                },
                RemediationAction::AddColumn {
                    name: "email".to_string(),
                    canonical_type: Text,
                },
                RemediationAction::CastRule {
                    name: "alcohol_percentage".to_string(),
                    from_type: Real,
                    to_type: Real,
                    on_loss: CoercionPolicy::RejectAndReport,
                },
            ],
        }
    }

    #[test]
    fn renders_mysql_statements_and_cast_directives() {
        let rendered = render_plan(&sample_plan(), "raw_pos", Dialect::Mysql).expect("render");
        assert_eq!(
            rendered.statements,
            [
                "ALTER TABLE `raw_pos` MODIFY COLUMN `alcohol_percentage` DOUBLE",
                "ALTER TABLE `raw_pos` ADD COLUMN `email` TEXT",
            ]
        );
        assert_eq!(rendered.casts.len(), 1);
        assert_eq!(rendered.casts[0].column, "alcohol_percentage");
    }

    #[test]
    fn renders_postgres_widen_with_using_clause() {
        let rendered = render_plan(&sample_plan(), "raw_pos", Dialect::Postgres).expect("render");
        assert_eq!(
            rendered.statements[0],
            "ALTER TABLE \"raw_pos\" ALTER COLUMN \"alcohol_percentage\" TYPE DOUBLE PRECISION USING \"alcohol_percentage\"::DOUBLE PRECISION"
        );
    }

    #[test]
    fn sqlite_cannot_widen_in_place() {
        let err = render_plan(&sample_plan(), "raw_pos", Dialect::Sqlite).expect_err("unsupported");
        assert!(matches!(err, ReconcileError::UnsupportedStatement { .. }));
    }

    #[test]
    fn quoting_escapes_embedded_quotes() {
        assert_eq!(Dialect::Sqlite.quote_identifier("odd\"name"), "\"odd\"\"name\"");
        assert_eq!(Dialect::Mysql.quote_identifier("odd`name"), "`odd``name`");
    }

    #[test]
    fn declared_type_names_map_back_to_their_canonical_type() {
        for dialect in [Dialect::Sqlite, Dialect::Mysql, Dialect::Postgres] {
            for ty in CanonicalType::variants() {
                assert_eq!(map_raw_type(dialect.type_name(*ty)), *ty, "{dialect} {ty}");
            }
        }
    }
}
