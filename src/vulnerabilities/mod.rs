//! The vulnerabilities module contains what's needed to keep a local copy
//! of the CVEs up to date.
//!
//! It is composed of two parts, fetchers and cache managers.
//! A fetcher is there to fetch the vulnerabilities from a source (e.g. NVD).
//! A cache manager stores the vulnerabilities fetched by the fetcher
//! (e.g. in files).
//! The [`updater::Updater`] drives both of them.

pub mod cache_managers;
pub mod enrichment;
pub mod fetchers;
pub mod summary;
pub mod updater;
