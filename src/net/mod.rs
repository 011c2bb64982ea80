//! Socket abstraction over TCP, unix sockets, and TLS.
mod socket;

pub use socket::Socket;
