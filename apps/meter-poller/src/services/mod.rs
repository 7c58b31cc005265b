pub mod accumulated;
pub mod historical;
