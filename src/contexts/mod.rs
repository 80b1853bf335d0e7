pub(crate) mod attribute_reference;
pub(crate) mod context;
pub(crate) mod context_builder;
mod context_serde;
