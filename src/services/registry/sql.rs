//! Dynamic SQL with `$n` placeholders, portable across the SQLite and
//! PostgreSQL drivers behind `sqlx::Any`.

use super::{Backend, FileQuery};
use crate::models::normalize_tag_name;
use sqlx::{
    Any, FromRow,
    any::{AnyArguments, AnyRow},
    query::QueryAs,
};

/// Columns of `files` in the order `FileRow` expects, qualified by `f`.
pub(super) const FILE_COLUMNS: &str = "f.id, f.dataset_id, f.bucket, f.prefix, f.stage, \
     f.filename, f.content_hash, f.mime_type, f.size_bytes, f.uri, f.created_at";

#[derive(Clone, Debug, PartialEq)]
pub(super) enum Param {
    Int(i64),
    Text(String),
}

impl From<i64> for Param {
    fn from(value: i64) -> Self {
        Param::Int(value)
    }
}

impl From<&str> for Param {
    fn from(value: &str) -> Self {
        Param::Text(value.to_string())
    }
}

impl From<String> for Param {
    fn from(value: String) -> Self {
        Param::Text(value)
    }
}

/// Accumulates SQL text and its bound parameters.
#[derive(Debug, Default)]
pub(super) struct SqlBuilder {
    sql: String,
    params: Vec<Param>,
}

impl SqlBuilder {
    pub(super) fn new(init: &str) -> Self {
        Self {
            sql: init.to_string(),
            params: Vec::new(),
        }
    }

    pub(super) fn push(&mut self, fragment: &str) -> &mut Self {
        self.sql.push_str(fragment);
        self
    }

    pub(super) fn push_bind(&mut self, value: impl Into<Param>) -> &mut Self {
        self.params.push(value.into());
        self.sql.push('$');
        self.sql.push_str(&self.params.len().to_string());
        self
    }

    /// Push `($a, $b, ...)`; callers must not pass an empty list.
    pub(super) fn push_list<I, T>(&mut self, values: I) -> &mut Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Param>,
    {
        self.sql.push('(');
        for (i, value) in values.into_iter().enumerate() {
            if i > 0 {
                self.sql.push_str(", ");
            }
            self.push_bind(value);
        }
        self.sql.push(')');
        self
    }

    pub(super) fn sql(&self) -> &str {
        &self.sql
    }

    #[cfg(test)]
    pub(super) fn params(&self) -> &[Param] {
        &self.params
    }

    pub(super) fn query_as<'q, O>(&'q self) -> QueryAs<'q, Any, O, AnyArguments<'q>>
    where
        O: for<'r> FromRow<'r, AnyRow>,
    {
        let mut query = sqlx::query_as::<Any, O>(&self.sql);
        for param in &self.params {
            query = match param {
                Param::Int(value) => query.bind(*value),
                Param::Text(value) => query.bind(value.as_str()),
            };
        }
        query
    }

}

/// Escape `LIKE` metacharacters so `needle` matches literally.
fn escape_like(needle: &str) -> String {
    let mut escaped = String::with_capacity(needle.len());
    for c in needle.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Case-insensitive literal substring filter on `column`.
///
/// Both sides are lowercased so SQLite and PostgreSQL agree on case.
pub(super) fn push_contains(builder: &mut SqlBuilder, column: &str, needle: &str) {
    builder
        .push(&format!(" AND LOWER({column}) LIKE "))
        .push_bind(format!("%{}%", escape_like(&needle.to_lowercase())))
        .push(" ESCAPE '\\'");
}

/// Pagination tail shared by list queries.
pub(super) fn push_page(
    builder: &mut SqlBuilder,
    backend: Backend,
    limit: Option<i64>,
    offset: Option<i64>,
) {
    match (limit, offset) {
        (Some(limit), _) => {
            builder.push(" LIMIT ").push_bind(limit);
        }
        (None, Some(_)) if backend == Backend::Sqlite => {
            builder.push(" LIMIT -1");
        }
        _ => {}
    }
    if let Some(offset) = offset {
        builder.push(" OFFSET ").push_bind(offset);
    }
}

/// `SELECT` for `Session::query_files`.
///
/// Domain and stage always filter; the tag filter matches files carrying any
/// of the given tags.
pub(super) fn file_query(backend: Backend, query: &FileQuery) -> SqlBuilder {
    let mut builder = SqlBuilder::new(&format!(
        "SELECT {FILE_COLUMNS} FROM files f JOIN datasets d ON d.id = f.dataset_id WHERE d.domain = "
    ));
    builder.push_bind(query.domain.as_str());
    builder.push(" AND f.stage = ").push_bind(query.stage.as_str());

    if let Some(dataset) = &query.dataset {
        builder.push(" AND d.name = ").push_bind(dataset.as_str());
    }
    if let Some(mime) = query.mime.as_deref().filter(|m| !m.is_empty()) {
        push_contains(&mut builder, "f.mime_type", mime);
    }

    let mut tags: Vec<String> = query
        .tags
        .iter()
        .map(|tag| normalize_tag_name(tag))
        .filter(|tag| !tag.is_empty())
        .collect();
    tags.sort();
    tags.dedup();
    if !tags.is_empty() {
        builder.push(
            " AND EXISTS (SELECT 1 FROM file_tags ft JOIN tags t ON t.id = ft.tag_id \
             WHERE ft.file_id = f.id AND t.name IN ",
        );
        builder.push_list(tags).push(")");
    }
    if !query.filenames.is_empty() {
        builder
            .push(" AND f.filename IN ")
            .push_list(query.filenames.iter().map(String::as_str));
    }
    if !query.hashes.is_empty() {
        builder
            .push(" AND f.content_hash IN ")
            .push_list(query.hashes.iter().map(String::as_str));
    }

    builder.push(" ORDER BY f.id");
    push_page(&mut builder, backend, query.limit, None);
    builder
}
