use std::sync::Arc;

use crate::{
    postgres::Oid,
    row::RowDescription,
};

/// A named server side object, either a prepared statement or a portal.
///
/// The empty name selects the unnamed statement or portal.
#[derive(Clone, PartialEq, Eq)]
pub struct ObjectName(Box<str>);

impl ObjectName {
    pub(crate) fn unnamed() -> Self {
        Self("".into())
    }

    pub(crate) fn named(name: impl Into<Box<str>>) -> Self {
        Self(name.into())
    }

    /// Generate the next auto assigned name, `<prefix><n>`.
    pub(crate) fn next(prefix: &str, counter: &mut u32) -> Self {
        let id = *counter;
        *counter = counter.wrapping_add(1);
        let mut buf = itoa::Buffer::new();
        let id = buf.format(id);
        let mut name = String::with_capacity(prefix.len() + id.len());
        name.push_str(prefix);
        name.push_str(id);
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_unnamed(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for ObjectName {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Debug for ObjectName {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_tuple("ObjectName").field(&self.as_str()).finish()
    }
}

impl AsRef<str> for ObjectName {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

/// A prepared statement kept on the server and reused across binds.
///
/// Created with [`Connection::prepare`][crate::Connection::prepare]. Executing
/// skips the parse and describe round trips, binding straight against the
/// parameter oids learned at prepare time. The statement stays alive on the
/// server until [`close`][Statement::close].
#[derive(Debug, Clone)]
pub struct Statement {
    pub(crate) name: ObjectName,
    pub(crate) param_oids: Vec<Oid>,
    pub(crate) desc: Option<Arc<RowDescription>>,
}

impl Statement {
    /// The server side statement name.
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Parameter type oids learned from `ParameterDescription`.
    pub fn param_oids(&self) -> &[Oid] {
        &self.param_oids
    }

    /// Result column names, empty when the statement returns no rows.
    pub fn column_names(&self) -> Vec<&str> {
        match &self.desc {
            Some(desc) => desc.names().collect(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn generated_names() {
        let mut counter = 0;
        let a = ObjectName::next("tsp_", &mut counter);
        let b = ObjectName::next("tsp_", &mut counter);
        assert_eq!(a.as_str(), "tsp_0");
        assert_eq!(b.as_str(), "tsp_1");
        assert!(!a.is_unnamed());
        assert!(ObjectName::unnamed().is_unnamed());
    }
}
