//! Integration tests driving whole components together through their
//! public APIs, the way the teacher's own `src/tests/` exercises full
//! lifecycles rather than single functions. Gated per-file so the
//! top-level `mod tests;` declaration in `lib.rs` stays test-only without
//! needing `#[cfg(test)]` repeated at every call site.

#[cfg(test)]
mod end_to_end;
