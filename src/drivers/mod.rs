pub mod lsm6dsl;
pub mod proximity;
pub mod sim7070g;
