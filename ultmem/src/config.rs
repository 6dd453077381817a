//! Configuration from the environment.
//!
//! The following variables are read, any other is ignored:
//!
//! -   `ULTMEM_PAGE_SIZE`: size of the pages, in bytes, with an optional `K`, `M` or `G` suffix.
//! -   `ULTMEM_STACK_SIZE`: default size of a stack, header included, same format.
//! -   `ULTMEM_MAX_EMPTY_PAGES`: number of empty pages each global pool retains.
//! -   `ULTMEM_LARGE_PAGE`: preferred kind of large page, one of `malloc`, `mmap`, `thp` or `huge`.
//! -   `ULTMEM_EXTERNAL_POOLING`: whether external callers are served by the global pools, `0`/`1` or `false`/`true`.
//!
//! A malformed value is reported with a warning, and the default is kept.

use std::env;

use ultmem_core::{Configuration, LargePageKind};

/// Resolves the configuration from the environment of the process.
pub fn configuration_from_env() -> Configuration { configuration_from(|name| env::var(name).ok()) }

/// Resolves the configuration from the variables supplied by `lookup`.
///
/// A configuration which fails validation as a whole is reported with a warning, and replaced by the default one.
pub fn configuration_from<F>(lookup: F) -> Configuration
    where
        F: Fn(&str) -> Option<String>,
{
    let mut configuration = Configuration::new();

    if let Some(page_size) = read(&lookup, PAGE_SIZE, parse_size) {
        configuration = configuration.with_page_size(page_size);
    }

    if let Some(stack_size) = read(&lookup, STACK_SIZE, parse_size) {
        configuration = configuration.with_stack_size(stack_size);
    }

    if let Some(max) = read(&lookup, MAX_EMPTY_PAGES, |value| value.parse().ok()) {
        configuration = configuration.with_max_global_empty_pages(max);
    }

    if let Some(kind) = read(&lookup, LARGE_PAGE, parse_large_page) {
        configuration = configuration.with_large_page(kind);
    }

    if let Some(external_pooling) = read(&lookup, EXTERNAL_POOLING, parse_bool) {
        configuration = configuration.with_external_pooling(external_pooling);
    }

    if let Err(error) = configuration.validate() {
        log::warn!("{}: {}, using defaults", error, describe(&configuration));
        return Configuration::new();
    }

    configuration
}

//
//  Implementation
//

const PAGE_SIZE: &str = "ULTMEM_PAGE_SIZE";
const STACK_SIZE: &str = "ULTMEM_STACK_SIZE";
const MAX_EMPTY_PAGES: &str = "ULTMEM_MAX_EMPTY_PAGES";
const LARGE_PAGE: &str = "ULTMEM_LARGE_PAGE";
const EXTERNAL_POOLING: &str = "ULTMEM_EXTERNAL_POOLING";

fn read<F, T>(lookup: &F, name: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T>
    where
        F: Fn(&str) -> Option<String>,
{
    let value = lookup(name)?;

    let result = parse(value.trim());

    if result.is_none() {
        log::warn!("{}: cannot parse {:?}, keeping default", name, value);
    }

    result
}

fn parse_size(value: &str) -> Option<usize> {
    let (digits, multiplier) = match value.char_indices().last()? {
        (i, 'k' | 'K') => (&value[..i], 1usize << 10),
        (i, 'm' | 'M') => (&value[..i], 1 << 20),
        (i, 'g' | 'G') => (&value[..i], 1 << 30),
        _ => (value, 1),
    };

    digits.parse::<usize>().ok()?.checked_mul(multiplier)
}

fn parse_large_page(value: &str) -> Option<LargePageKind> {
    match value.to_ascii_lowercase().as_str() {
        "malloc" => Some(LargePageKind::Malloc),
        "mmap" => Some(LargePageKind::Mapped),
        "thp" => Some(LargePageKind::TransparentHuge),
        "huge" => Some(LargePageKind::Huge),
        _ => None,
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" => Some(true),
        "0" | "false" => Some(false),
        _ => None,
    }
}

fn describe(configuration: &Configuration) -> String {
    format!("page size {}, stack size {}", configuration.page_size(), configuration.stack_size())
}

// mod tests
