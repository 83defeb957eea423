//! Build script for the job store.
//!
//! `sqlx::migrate!` embeds the files under `migrations/` at compile time,
//! so a changed migration has to trigger a rebuild.

fn main() {
    println!("cargo:rerun-if-changed=migrations/");
}
