mod domain;
mod scalar;
mod traversal;
