pub(crate) mod compact;
pub(crate) mod index;
pub(crate) mod restore;
pub(crate) mod verify;
