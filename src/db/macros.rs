//! Dispatch macro for the sqlx-backed sessions.
//!
//! The three sqlx connection types share no object-safe trait covering
//! fetch/execute with bound parameters, so each operation is written once and
//! expanded per backend at compile time.

/// Expand `$body` once per [`SqlxSession`](crate::db::sqlx_driver::SqlxSession)
/// variant, with `$conn` bound to the concrete connection and `$bind` aliased
/// to that backend's parameter binder.
///
/// # Example
///
/// ```ignore
/// impl_session_dispatch!(self, conn, bind => {
///     bind(sql, params).execute(&mut *conn).await
/// })
/// ```
macro_rules! impl_session_dispatch {
    ($session:expr, $conn:ident, $bind:ident => $body:expr) => {
        match $session {
            $crate::db::sqlx_driver::SqlxSession::Sqlite($conn) => {
                use $crate::db::params::bind_sqlite as $bind;
                $body
            }
            $crate::db::sqlx_driver::SqlxSession::Postgres($conn) => {
                use $crate::db::params::bind_postgres as $bind;
                $body
            }
            $crate::db::sqlx_driver::SqlxSession::MySql($conn) => {
                use $crate::db::params::bind_mysql as $bind;
                $body
            }
        }
    };
}

pub(crate) use impl_session_dispatch;
