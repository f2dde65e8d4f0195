use crate::error::TransferError;
use async_trait::async_trait;

/// One foreign-key constraint, addressed by its owning (parent) table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyConstraint {
    pub schema: String,
    pub table: String,
    pub name: String,
}

impl ForeignKeyConstraint {
    pub fn qualified_table(&self) -> String {
        format!("[{}].[{}]", self.schema, self.table)
    }
}

/// Dialect-specific constraint operations. The production implementation
/// talks to the destination's management connection; tests swap in a fake.
#[async_trait]
pub trait ConstraintCatalog: Send + Sync {
    /// Every FK constraint in which `table` participates as parent or child.
    async fn discover(&self, table: &str) -> Result<Vec<ForeignKeyConstraint>, TransferError>;

    /// Disables enforcement for the whole set in one batched statement.
    async fn disable(&self, constraints: &[ForeignKeyConstraint]) -> Result<(), TransferError>;

    /// Re-enables the whole set with full validation in one batched
    /// statement.
    async fn enable(&self, constraints: &[ForeignKeyConstraint]) -> Result<(), TransferError>;
}

/// Record of a successful suspension; resuming re-enables exactly the
/// constraints that were discovered at suspend time.
#[derive(Debug, Clone)]
pub struct FkSuspension {
    pub table: String,
    pub constraints: Vec<ForeignKeyConstraint>,
}

/// Wraps the catalog with the failure semantics the transfer needs: a failed
/// suspend is logged and non-fatal (the transfer proceeds at risk), a failed
/// resume leaves integrity unenforced and is logged at error level.
pub struct ForeignKeyGuard<'a> {
    catalog: &'a dyn ConstraintCatalog,
}

impl<'a> ForeignKeyGuard<'a> {
    pub fn new(catalog: &'a dyn ConstraintCatalog) -> Self {
        ForeignKeyGuard { catalog }
    }

    pub async fn suspend(&self, table: &str) -> Option<FkSuspension> {
        let constraints = match self.catalog.discover(table).await {
            Ok(constraints) => constraints,
            Err(err) => {
                log::warn!(
                    "Could not discover foreign key constraints for {}: {}; transfer proceeds with constraints enforced",
                    table,
                    err
                );
                return None;
            }
        };

        if constraints.is_empty() {
            log::debug!("No foreign key constraints reference {}", table);
            return Some(FkSuspension {
                table: table.to_string(),
                constraints,
            });
        }

        match self.catalog.disable(&constraints).await {
            Ok(()) => {
                log::info!(
                    "Disabled {} foreign key constraint(s) around {}",
                    constraints.len(),
                    table
                );
                Some(FkSuspension {
                    table: table.to_string(),
                    constraints,
                })
            }
            Err(err) => {
                log::warn!(
                    "Failed to disable foreign key constraints for {}: {}; transfer proceeds with constraints enforced",
                    table,
                    err
                );
                None
            }
        }
    }

    pub async fn resume(&self, suspension: &FkSuspension) {
        if suspension.constraints.is_empty() {
            return;
        }

        match self.catalog.enable(&suspension.constraints).await {
            Ok(()) => log::info!(
                "Re-enabled {} foreign key constraint(s) around {}",
                suspension.constraints.len(),
                suspension.table
            ),
            Err(err) => log::error!(
                "FOREIGN KEY CONSTRAINTS LEFT DISABLED on {}: re-enable failed: {}. Referential integrity is unenforced until the constraints are re-checked manually.",
                suspension.table,
                err
            ),
        }
    }
}

/// Batched NOCHECK script. One round trip toggles the full set.
pub fn build_disable_script(constraints: &[ForeignKeyConstraint]) -> String {
    constraints
        .iter()
        .map(|fk| {
            format!(
                "ALTER TABLE {} NOCHECK CONSTRAINT [{}];",
                fk.qualified_table(),
                fk.name
            )
        })
        .collect::<Vec<String>>()
        .join("\n")
}

/// Batched re-enable script. WITH CHECK revalidates existing rows, so a
/// resume after a resume validates each constraint exactly once in effect.
pub fn build_enable_script(constraints: &[ForeignKeyConstraint]) -> String {
    constraints
        .iter()
        .map(|fk| {
            format!(
                "ALTER TABLE {} WITH CHECK CHECK CONSTRAINT [{}];",
                fk.qualified_table(),
                fk.name
            )
        })
        .collect::<Vec<String>>()
        .join("\n")
}

/// Catalog query for every constraint where the table is parent or child.
/// Matches both the bracket-qualified form the UI stores and a bare table
/// name.
pub const DISCOVER_CONSTRAINTS_SQL: &str = "\
SELECT SCHEMA_NAME(pt.schema_id) AS SchemaName, pt.name AS TableName, fk.name AS ConstraintName
FROM sys.foreign_keys fk
JOIN sys.tables pt ON fk.parent_object_id = pt.object_id
JOIN sys.tables rt ON fk.referenced_object_id = rt.object_id
WHERE '[' + SCHEMA_NAME(pt.schema_id) + '].[' + pt.name + ']' = @P1
   OR '[' + SCHEMA_NAME(rt.schema_id) + '].[' + rt.name + ']' = @P1
   OR pt.name = @P1
   OR rt.name = @P1";
