pub mod context;
pub mod ordered;
pub mod predicate;
pub mod sharding;
