//! End-to-end scenarios that drive [`kbchat_core::AppContext`] through a
//! scripted backend.

#[cfg(test)]
mod unit;
