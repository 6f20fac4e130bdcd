//! A Postgres wire-protocol client engine that streams raw, undecoded values.
//!
//! ```no_run
//! use pg_raw::{ConnectionBuilder, StatementEvent, Target, TlsOptions};
//!
//! # async fn example() -> pg_raw::Result<()> {
//! let (client, conn) = ConnectionBuilder::new("postgres")
//!     .password("secret")
//!     .connect_to(&Target::tcp("localhost", 5432), &TlsOptions::default())
//!     .await?;
//! tokio::spawn(conn.run());
//!
//! let mut stmt = client.execute("SELECT $1::text", vec!["hello".into()]);
//! while let Some(event) = stmt.next_event().await {
//!     if let StatementEvent::Row(row) = event {
//!         println!("{:?}", row[0]);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod connection;
mod error;
pub mod messages;
mod pipeline;
mod startup;
mod statement;
mod stream;
mod transport;

pub use connection::{Client, Connection, ConnectionEvent, ConnectionState};
pub use error::*;
pub use messages::{
    backend::{self, Notification, TransactionStatus},
    frontend::{self, FormatCode, Param},
};
pub use startup::*;
pub use statement::{
    CommandComplete, FieldDescriptor, Row, Statement, StatementEvent, Terminal,
};
pub use stream::{PgStream, ResultFormat};
pub use transport::{Keepalive, Socket, Target};
