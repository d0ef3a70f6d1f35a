pub mod approval;
pub mod instance;
pub mod template;
pub mod ws;
