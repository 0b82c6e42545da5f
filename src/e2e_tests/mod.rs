//! End-to-end protocol scenarios driven through the dispatcher without a
//! socket: craft framed requests, feed them to `Connection::process` and
//! check the framed responses byte-for-byte where it matters.

mod helpers;
mod scenarios;
