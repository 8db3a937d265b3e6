//! Backend-specific SQL fragments

use crate::{Result, StoreError};
use std::fmt;
use std::str::FromStr;

/// Supported database backends, resolved once from the configured driver name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// PostgreSQL
    Postgres,
    /// MySQL / MariaDB
    Mysql,
    /// SQLite (embedded deployments and tests)
    Sqlite,
}

impl Dialect {
    /// Driver name as written in configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Postgres => "postgres",
            Dialect::Mysql => "mysql",
            Dialect::Sqlite => "sqlite",
        }
    }

    /// Expression evaluating to the database's current time in epoch seconds
    pub fn now(&self) -> &'static str {
        match self {
            Dialect::Postgres => "EXTRACT(EPOCH FROM now())::numeric::integer",
            Dialect::Mysql => "UNIX_TIMESTAMP()",
            Dialect::Sqlite => "CAST(strftime('%s','now') AS INTEGER)",
        }
    }

    /// Auto-increment primary key column definition
    pub fn id_column(&self) -> &'static str {
        match self {
            Dialect::Postgres => "id SERIAL PRIMARY KEY",
            Dialect::Mysql => "id int NOT NULL AUTO_INCREMENT, PRIMARY KEY (id)",
            Dialect::Sqlite => "id INTEGER PRIMARY KEY AUTOINCREMENT",
        }
    }

    /// `CREATE TABLE` statement for the lease table
    pub fn create_subnets_table(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS subnets (\
             {}\
             , underlay_ip varchar(15) NOT NULL\
             , overlay_subnet varchar(18) NOT NULL\
             , overlay_hwaddr varchar(17) NOT NULL\
             , last_renewed_at bigint NOT NULL\
             , UNIQUE (underlay_ip)\
             , UNIQUE (overlay_subnet)\
             , UNIQUE (overlay_hwaddr)\
             )",
            self.id_column()
        )
    }

    /// Rewrite `?` placeholders into the backend's native syntax.
    ///
    /// Question marks inside single-quoted literals are left alone.
    pub fn rebind(&self, query: &str) -> String {
        if *self != Dialect::Postgres {
            return query.to_string();
        }

        let mut rebound = String::with_capacity(query.len() + 8);
        let mut in_literal = false;
        let mut index = 0;
        for c in query.chars() {
            match c {
                '\'' => {
                    in_literal = !in_literal;
                    rebound.push(c);
                }
                '?' if !in_literal => {
                    index += 1;
                    rebound.push('$');
                    rebound.push_str(&index.to_string());
                }
                _ => rebound.push(c),
            }
        }
        rebound
    }
}

impl FromStr for Dialect {
    type Err = StoreError;

    fn from_str(driver: &str) -> Result<Self> {
        match driver {
            "postgres" => Ok(Dialect::Postgres),
            "mysql" => Ok(Dialect::Mysql),
            "sqlite" => Ok(Dialect::Sqlite),
            other => Err(StoreError::UnsupportedDriver(other.to_string())),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
