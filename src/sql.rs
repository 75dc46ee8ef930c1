use crate::error::{RelationError, SqlExecError};
use crate::model::{
    value_dict, ColumnAttribute, ColumnAttributes, ColumnNames, DataType, Handle, Identifier,
    Value, ValueDict,
};
use crate::parse::{
    ColumnDefinition, CreateIndexStatement, CreateTableStatement, DeclaredType, DropKind,
    DropStatement, ShowKind, ShowStatement, Statement,
};
use crate::result::QueryResult;
use crate::schema::{is_schema_table, Catalog, COLUMNS_TABLE};
use crate::store::{DbRelation, Store};
use tracing::{debug, info, warn};

/// Execution context: the storage environment plus the catalog opened over it.
pub struct SqlExec {
    store: Store,
    catalog: Option<Catalog>,
}

impl SqlExec {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            catalog: None,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    fn catalog(&mut self) -> Result<&Catalog, SqlExecError> {
        let catalog = match self.catalog.take() {
            Some(catalog) => catalog,
            None => Catalog::open(&self.store)?,
        };
        Ok(self.catalog.insert(catalog))
    }

    pub fn execute(&mut self, statement: &Statement) -> Result<QueryResult, SqlExecError> {
        debug!(%statement, "execute");
        let catalog = self.catalog()?;
        match statement {
            Statement::CreateTable(stmt) => create_table(catalog, stmt),
            Statement::CreateIndex(stmt) => create_index(catalog, stmt),
            Statement::Drop(stmt) => execute_drop(catalog, stmt),
            Statement::Show(stmt) => show(catalog, stmt),
            Statement::Other(_) => Ok(QueryResult::message("not implemented")),
        }
    }
}

/// Catalog rows written by the statement in flight.
///
/// Unless [`CatalogUndo::commit`] is called, dropping the guard deletes the
/// recorded rows in reverse order. Failures there are logged and skipped so the
/// error that aborted the statement is the one reported.
struct CatalogUndo<'a> {
    written: Vec<(&'a dyn DbRelation, Handle)>,
    committed: bool,
}

impl<'a> CatalogUndo<'a> {
    fn new() -> Self {
        Self {
            written: Vec::new(),
            committed: false,
        }
    }

    fn record(&mut self, relation: &'a dyn DbRelation, handle: Handle) {
        self.written.push((relation, handle));
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for CatalogUndo<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for (relation, handle) in self.written.drain(..).rev() {
            if let Err(e) = relation.del(handle) {
                warn!(
                    relation = relation.table_name(),
                    ?handle,
                    error = %e,
                    "could not undo catalog row"
                );
            }
        }
    }
}

fn translate_columns(
    table_name: &str,
    columns: &[ColumnDefinition],
) -> Result<Vec<(Identifier, DataType)>, SqlExecError> {
    if columns.is_empty() {
        return Err(SqlExecError::Definition(format!(
            "table {table_name} needs at least one column"
        )));
    }
    let mut out: Vec<(Identifier, DataType)> = Vec::with_capacity(columns.len());
    for column in columns {
        let data_type = match &column.data_type {
            DeclaredType::Int => DataType::Int,
            DeclaredType::Text => DataType::Text,
            DeclaredType::Other(name) => {
                return Err(SqlExecError::Definition(format!("{} {name}", column.name)))
            }
        };
        if out.iter().any(|(name, _)| *name == column.name) {
            return Err(SqlExecError::Definition(format!(
                "duplicate column {}",
                column.name
            )));
        }
        out.push((column.name.clone(), data_type));
    }
    Ok(out)
}

fn create_table(
    catalog: &Catalog,
    stmt: &CreateTableStatement,
) -> Result<QueryResult, SqlExecError> {
    let table_name = stmt.table_name.as_str();
    let columns = translate_columns(table_name, &stmt.columns)?;

    if stmt.if_not_exists && catalog.tables.contains(table_name)? {
        catalog.tables.get_table(table_name)?.create_if_not_exists()?;
        return Ok(QueryResult::message(format!(
            "table {table_name} already exists"
        )));
    }

    let column_catalog = catalog.tables.get_table(COLUMNS_TABLE)?;
    let mut undo = CatalogUndo::new();

    let handle = catalog
        .tables
        .insert(&value_dict([("table_name", table_name)]))?;
    undo.record(&catalog.tables, handle);

    for (column_name, data_type) in &columns {
        let handle = column_catalog.insert(&value_dict([
            ("table_name", table_name),
            ("column_name", column_name.as_str()),
            ("data_type", data_type.as_str()),
        ]))?;
        undo.record(column_catalog.as_ref(), handle);
    }

    catalog.tables.evict(table_name);
    let created = catalog.tables.get_table(table_name).and_then(|table| {
        if stmt.if_not_exists {
            table.create_if_not_exists()
        } else {
            table.create()
        }
    });
    if let Err(e) = created {
        catalog.tables.evict(table_name);
        return Err(e.into());
    }

    undo.commit();
    info!(table = table_name, columns = columns.len(), "created table");
    Ok(QueryResult::message(format!("created {table_name}")))
}

fn execute_drop(catalog: &Catalog, stmt: &DropStatement) -> Result<QueryResult, SqlExecError> {
    match &stmt.kind {
        DropKind::Table => drop_table(catalog, stmt),
        DropKind::Index => drop_index(catalog, stmt),
        DropKind::Other(kind) => Err(SqlExecError::Shape(format!("DROP {kind}"))),
    }
}

fn drop_table(catalog: &Catalog, stmt: &DropStatement) -> Result<QueryResult, SqlExecError> {
    if stmt.kind != DropKind::Table {
        return Err(SqlExecError::Shape(format!(
            "DROP TABLE handler given {statement}",
            statement = Statement::Drop(stmt.clone())
        )));
    }
    let table_name = stmt.name.as_str();
    if is_schema_table(table_name) {
        return Err(SqlExecError::Guard(format!(
            "cannot drop a schema table: {table_name}"
        )));
    }
    if !catalog.tables.contains(table_name)? {
        if stmt.if_exists {
            return Ok(QueryResult::message(format!(
                "table {table_name} does not exist"
            )));
        }
        return Err(RelationError::NotFound(format!("unknown table: {table_name}")).into());
    }

    for index_name in catalog.indices.get_index_names(table_name)? {
        remove_index(catalog, table_name, &index_name)?;
    }

    let table = catalog.tables.get_table(table_name)?;
    catalog.tables.evict(table_name);

    let column_catalog = catalog.tables.get_table(COLUMNS_TABLE)?;
    let filter = value_dict([("table_name", table_name)]);
    for handle in column_catalog.select(Some(&filter))? {
        column_catalog.del(handle)?;
    }

    table.drop_relation()?;

    if let Some(handle) = catalog.tables.find(table_name)? {
        catalog.tables.del(handle)?;
    }
    info!(table = table_name, "dropped table");
    Ok(QueryResult::message(format!("dropped {table_name}")))
}

fn drop_index(catalog: &Catalog, stmt: &DropStatement) -> Result<QueryResult, SqlExecError> {
    let (DropKind::Index, Some(index_name)) = (&stmt.kind, stmt.index_name.as_deref()) else {
        return Err(SqlExecError::Shape(format!(
            "DROP INDEX handler given {statement}",
            statement = Statement::Drop(stmt.clone())
        )));
    };
    if stmt.if_exists && !catalog.indices.contains(&stmt.name, index_name)? {
        return Ok(QueryResult::message(format!(
            "index {index_name} does not exist"
        )));
    }
    remove_index(catalog, &stmt.name, index_name)?;
    info!(table = %stmt.name, index = index_name, "dropped index");
    Ok(QueryResult::message(format!("dropped index {index_name}")))
}

/// Drops the physical index, then its `_indices` rows.
fn remove_index(
    catalog: &Catalog,
    table_name: &str,
    index_name: &str,
) -> Result<(), SqlExecError> {
    let index = catalog.get_index(table_name, index_name)?;
    let filter = value_dict([("table_name", table_name), ("index_name", index_name)]);
    let handles = catalog.indices.select(Some(&filter))?;

    index.drop_index()?;
    for handle in handles {
        catalog.indices.del(handle)?;
    }
    debug!(table = table_name, index = index_name, "removed index");
    Ok(())
}

fn create_index(
    catalog: &Catalog,
    stmt: &CreateIndexStatement,
) -> Result<QueryResult, SqlExecError> {
    let table_name = stmt.table_name.as_str();
    let index_name = stmt.index_name.as_str();
    if is_schema_table(table_name) {
        return Err(SqlExecError::Guard(format!(
            "cannot index a schema table: {table_name}"
        )));
    }
    if !catalog.tables.contains(table_name)? {
        return Err(RelationError::NotFound(format!("unknown table: {table_name}")).into());
    }

    if stmt.columns.is_empty() {
        return Err(SqlExecError::Definition(format!(
            "index {index_name} needs at least one column"
        )));
    }
    let (table_columns, _) = catalog.tables.get_columns(table_name)?;
    for (i, column) in stmt.columns.iter().enumerate() {
        if !table_columns.contains(column) {
            return Err(SqlExecError::Definition(format!(
                "{table_name} has no column {column}"
            )));
        }
        if stmt.columns[..i].contains(column) {
            return Err(SqlExecError::Definition(format!(
                "column {column} listed twice in index {index_name}"
            )));
        }
    }

    if catalog.indices.contains(table_name, index_name)? {
        if stmt.if_not_exists {
            return Ok(QueryResult::message(format!(
                "index {index_name} already exists"
            )));
        }
        return Err(RelationError::Invalid(format!(
            "duplicate index {table_name}.{index_name}"
        ))
        .into());
    }

    let mut undo = CatalogUndo::new();
    for (seq, column) in (1..).zip(&stmt.columns) {
        let row = value_dict([
            ("table_name", Value::from(table_name)),
            ("index_name", Value::from(index_name)),
            ("seq_in_index", Value::Int(seq)),
            ("column_name", Value::from(column.as_str())),
            ("index_type", Value::from(stmt.index_kind.as_str())),
            ("is_unique", Value::Boolean(stmt.unique)),
        ]);
        let handle = catalog.indices.insert(&row)?;
        undo.record(&catalog.indices, handle);
    }

    catalog.get_index(table_name, index_name)?.create()?;

    undo.commit();
    info!(
        table = table_name,
        index = index_name,
        kind = stmt.index_kind.as_str(),
        unique = stmt.unique,
        "created index"
    );
    Ok(QueryResult::message(format!("created index {index_name}")))
}

fn show(catalog: &Catalog, stmt: &ShowStatement) -> Result<QueryResult, SqlExecError> {
    match stmt.kind {
        ShowKind::Tables => show_tables(catalog),
        ShowKind::Columns => show_columns(catalog, stmt),
        ShowKind::Index => show_index(catalog, stmt),
    }
}

fn rows_result(
    column_names: ColumnNames,
    column_attributes: ColumnAttributes,
    rows: Vec<ValueDict>,
) -> QueryResult {
    let message = format!("successfully returned {} rows", rows.len());
    QueryResult::with_rows(column_names, column_attributes, rows, message)
}

fn show_tables(catalog: &Catalog) -> Result<QueryResult, SqlExecError> {
    let column_names = catalog.tables.column_names().to_vec();
    let column_attributes = catalog.tables.column_attributes().to_vec();

    let mut rows = Vec::new();
    for handle in catalog.tables.select(None)? {
        let row = catalog
            .tables
            .project(handle, Some(column_names.as_slice()))?;
        let listed = row
            .get("table_name")
            .and_then(Value::as_str)
            .is_some_and(|name| !is_schema_table(name));
        if listed {
            rows.push(row);
        }
    }
    Ok(rows_result(column_names, column_attributes, rows))
}

fn shown_table(stmt: &ShowStatement) -> Result<&str, SqlExecError> {
    stmt.table_name.as_deref().ok_or_else(|| {
        SqlExecError::Shape(format!(
            "{statement} needs a table",
            statement = Statement::Show(stmt.clone())
        ))
    })
}

/// Projects the rows of `relation` whose `table_name` is `table_name`.
fn project_table_rows(
    relation: &dyn DbRelation,
    table_name: &str,
    columns: &[(&str, DataType)],
) -> Result<QueryResult, SqlExecError> {
    let (column_names, column_attributes): (ColumnNames, ColumnAttributes) = columns
        .iter()
        .map(|(name, ty)| (name.to_string(), ColumnAttribute::new(*ty)))
        .unzip();

    let filter = value_dict([("table_name", table_name)]);
    let rows = relation
        .select(Some(&filter))?
        .into_iter()
        .map(|handle| relation.project(handle, Some(column_names.as_slice())))
        .collect::<Result<Vec<_>, RelationError>>()?;
    Ok(rows_result(column_names, column_attributes, rows))
}

fn show_columns(catalog: &Catalog, stmt: &ShowStatement) -> Result<QueryResult, SqlExecError> {
    let table_name = shown_table(stmt)?;
    let column_catalog = catalog.tables.get_table(COLUMNS_TABLE)?;
    project_table_rows(
        column_catalog.as_ref(),
        table_name,
        &[
            ("table_name", DataType::Text),
            ("column_name", DataType::Text),
            ("data_type", DataType::Text),
        ],
    )
}

fn show_index(catalog: &Catalog, stmt: &ShowStatement) -> Result<QueryResult, SqlExecError> {
    let table_name = shown_table(stmt)?;
    project_table_rows(
        &catalog.indices,
        table_name,
        &[
            ("table_name", DataType::Text),
            ("index_name", DataType::Text),
            ("seq_in_index", DataType::Int),
            ("column_name", DataType::Text),
            ("index_type", DataType::Text),
            ("is_unique", DataType::Boolean),
        ],
    )
}
