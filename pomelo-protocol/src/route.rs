//! Route dictionary: bidirectional route <-> 16-bit code mapping.
//!
//! The server announces the mapping in the handshake (`sys.dict`). Once
//! installed, the message codec sends a 2-byte code instead of the inline
//! route for every known route.

use crate::error::MessageError;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
struct Tables {
    routes: HashMap<String, u16>,
    codes: HashMap<u16, String>,
}

/// Shared route dictionary. Written at handshake time, read by every encode
/// and decode afterward.
#[derive(Debug, Default)]
pub struct RouteDictionary {
    tables: RwLock<Tables>,
}

impl RouteDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a mapping.
    ///
    /// The whole mapping is checked before anything is written: if a route or
    /// a code is already present, or two routes in `mapping` share a code,
    /// nothing is installed and [`MessageError::DuplicateRoute`] is returned.
    pub fn install<'a, I>(&self, mapping: I) -> Result<usize, MessageError>
    where
        I: IntoIterator<Item = (&'a String, &'a u16)>,
    {
        let mut tables = self.tables.write();

        let entries: Vec<(&String, u16)> = mapping.into_iter().map(|(r, c)| (r, *c)).collect();
        let mut seen_codes = HashSet::with_capacity(entries.len());
        for (route, code) in &entries {
            if tables.routes.contains_key(*route)
                || tables.codes.contains_key(code)
                || !seen_codes.insert(*code)
            {
                return Err(MessageError::DuplicateRoute {
                    route: (*route).clone(),
                    code: *code,
                });
            }
        }

        for (route, code) in &entries {
            tables.routes.insert((*route).clone(), *code);
            tables.codes.insert(*code, (*route).clone());
        }

        Ok(entries.len())
    }

    /// Returns the code for `route`, if compressed.
    pub fn code_of(&self, route: &str) -> Option<u16> {
        self.tables.read().routes.get(route).copied()
    }

    /// Returns the route registered for `code`.
    pub fn route_of(&self, code: u16) -> Option<String> {
        self.tables.read().codes.get(&code).cloned()
    }

    pub fn len(&self) -> usize {
        self.tables.read().routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.read().routes.is_empty()
    }

    /// Removes every entry. Called before each new handshake.
    pub fn clear(&self) {
        let mut tables = self.tables.write();
        tables.routes.clear();
        tables.codes.clear();
    }
}
