pub(crate) mod bucket;
pub(crate) mod config;
pub(crate) mod constants;
pub(crate) mod direct_map;
pub(crate) mod error;
pub(crate) mod freelist;
pub(crate) mod heap;
pub(crate) mod hooks;
pub(crate) mod integrity;
pub(crate) mod loom_tests;
pub(crate) mod oom;
pub(crate) mod pages;
pub(crate) mod partition;
pub(crate) mod purge;
pub(crate) mod slot_span;
pub(crate) mod stats;
pub(crate) mod super_page;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
