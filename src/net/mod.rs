pub mod connector;

pub use connector::{BoxedStream, Connector, TcpConnector, Transport};
