use crate::endpoint::LogicalEndpoint;
use crate::message::types::TypeTag;

/// A dynamic scope name: the dispatcher's analogue of a tenant or
/// sub-application qualifier alongside `(type, endpoint)`.
pub type Scope = String;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerKey {
    pub type_tag: TypeTag,
    pub logical_ep: Option<LogicalEndpoint>,
    pub scope: Option<Scope>,
}
