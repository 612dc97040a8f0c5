mod redirect;

pub use redirect::{BatchItem, Redirect, RedirectState};
