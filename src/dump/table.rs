use crate::util::sql_escape::escape_identifier;

/// Table kind as reported by `SHOW FULL TABLES`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Base,
    View,
}

impl TableKind {
    pub fn parse(kind: &str) -> Self {
        match kind {
            "VIEW" | "SYSTEM VIEW" => TableKind::View,
            _ => TableKind::Base,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TableKind::Base => "BASE TABLE",
            TableKind::View => "VIEW",
        }
    }
}

/// Catalog descriptor. `row_count` and `columns` start empty and are
/// populated by the orchestrator before the data phase; views never get
/// that far.
#[derive(Debug, Clone)]
pub struct Table {
    pub name: String,
    pub kind: TableKind,
    pub row_count: u64,
    pub columns: Vec<String>,
}

impl Table {
    pub fn new(name: impl Into<String>, kind: TableKind) -> Self {
        Self {
            name: name.into(),
            kind,
            row_count: 0,
            columns: Vec::new(),
        }
    }

    pub fn is_view(&self) -> bool {
        self.kind == TableKind::View
    }

    /// Backtick-quoted column list for SELECT; `*` until columns are loaded.
    pub fn column_list(&self) -> String {
        if self.columns.is_empty() {
            return "*".to_string();
        }

        self.columns
            .iter()
            .map(|column| escape_identifier(column))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parse() {
        assert_eq!(TableKind::parse("BASE TABLE"), TableKind::Base);
        assert_eq!(TableKind::parse("VIEW"), TableKind::View);
        assert_eq!(TableKind::parse("SYSTEM VIEW"), TableKind::View);
        assert_eq!(TableKind::parse("unexpected"), TableKind::Base);
    }

    #[test]
    fn test_column_list() {
        let mut table = Table::new("users", TableKind::Base);
        assert_eq!(table.column_list(), "*");

        table.columns = vec!["id".to_string(), "name".to_string()];
        assert_eq!(table.column_list(), "`id`, `name`");
    }
}
