use crate::{options::ServerAddress, sdam::description::ServerDescription};

pub use crate::sdam::description::ServerType;

/// A view of the most up-to-date information known about a given server, as
/// presented to server-selection predicates.
#[derive(Clone, Debug)]
pub struct ServerInfo<'a> {
    description: &'a ServerDescription,
}

impl<'a> ServerInfo<'a> {
    pub(crate) fn new(description: &'a ServerDescription) -> Self {
        Self { description }
    }

    /// Gets the address of the server.
    pub fn address(&self) -> &ServerAddress {
        &self.description.address
    }

    /// Gets the type of the server.
    pub fn server_type(&self) -> ServerType {
        self.description.server_type
    }

    /// Gets the maximum wire version the server understands, if known.
    pub fn max_wire_version(&self) -> Option<i32> {
        self.description.max_wire_version
    }
}
