//! Domain-level boilerplate detection.
//!
//! Cookie banners, footers and nav blocks repeat across the pages of one
//! domain. Split each page into blank-line blocks, fingerprint the blocks,
//! and flag any block present on enough pages. Flagged blocks are stripped
//! from stored `cleaned_content`.

use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct BoilerplateConfig {
    /// Fraction of pages a block must appear on to count as boilerplate.
    pub threshold_pct: f64,
    /// Minimum pages before the analysis runs at all.
    pub min_pages: usize,
    /// Blocks shorter than this are ignored.
    pub min_block_chars: usize,
}

impl Default for BoilerplateConfig {
    fn default() -> Self {
        Self {
            threshold_pct: 0.7,
            min_pages: 5,
            min_block_chars: 50,
        }
    }
}

/// Outcome of analyzing one domain's pages.
#[derive(Debug, Clone, Default)]
pub struct BoilerplateAnalysis {
    pub boilerplate_hashes: Vec<String>,
    pub pages_analyzed: usize,
    pub blocks_total: usize,
    pub blocks_boilerplate: usize,
    pub bytes_removed_avg: usize,
}

/// Stable 16-hex-char digest of a normalized block.
pub fn block_hash(block: &str) -> String {
    let normalized = normalize_block(block);
    let digest = Sha256::digest(normalized.as_bytes());
    hex::encode(&digest[..8])
}

/// Case-insensitive, whitespace-collapsed form used for fingerprinting, so
/// cosmetic whitespace differences between pages do not split a block.
fn normalize_block(block: &str) -> String {
    block.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Blank-line blocks of at least `min_block_chars` characters.
fn split_blocks(content: &str, min_block_chars: usize) -> Vec<&str> {
    content
        .split("\n\n")
        .map(str::trim)
        .filter(|block| block.len() >= min_block_chars)
        .collect()
}

/// Analyze a set of pages from one domain.
///
/// A block counts once per page no matter how often it repeats within that
/// page. Returns None when there are fewer than `min_pages` pages.
pub fn analyze_domain(pages: &[&str], config: &BoilerplateConfig) -> Option<BoilerplateAnalysis> {
    if pages.len() < config.min_pages {
        return None;
    }

    let mut page_counts: HashMap<String, usize> = HashMap::new();
    let mut blocks_total = 0;

    for page in pages {
        let mut seen_on_page: HashSet<String> = HashSet::new();
        for block in split_blocks(page, config.min_block_chars) {
            blocks_total += 1;
            seen_on_page.insert(block_hash(block));
        }
        for hash in seen_on_page {
            *page_counts.entry(hash).or_insert(0) += 1;
        }
    }

    let required = (config.threshold_pct * pages.len() as f64).ceil() as usize;
    let mut boilerplate_hashes: Vec<String> = page_counts
        .into_iter()
        .filter(|(_, count)| *count >= required)
        .map(|(hash, _)| hash)
        .collect();
    boilerplate_hashes.sort();

    let hash_set: HashSet<&String> = boilerplate_hashes.iter().collect();
    let total_removed: usize = pages
        .iter()
        .map(|page| {
            split_blocks(page, config.min_block_chars)
                .iter()
                .filter(|block| hash_set.contains(&block_hash(block)))
                .map(|block| block.len())
                .sum::<usize>()
        })
        .sum();

    Some(BoilerplateAnalysis {
        blocks_boilerplate: boilerplate_hashes.len(),
        boilerplate_hashes,
        pages_analyzed: pages.len(),
        blocks_total,
        bytes_removed_avg: total_removed / pages.len(),
    })
}

/// Remove every block whose hash is in the flagged set.
pub fn strip_boilerplate(content: &str, hashes: &[String], min_block_chars: usize) -> String {
    if hashes.is_empty() {
        return content.trim().to_string();
    }
    let flagged: HashSet<&String> = hashes.iter().collect();

    content
        .split("\n\n")
        .map(str::trim)
        .filter(|block| {
            block.len() < min_block_chars || !flagged.contains(&block_hash(block))
        })
        .filter(|block| !block.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const BANNER: &str = "We use cookies to improve your experience on our website. By continuing to browse you agree to our use of cookies and our privacy policy which applies to all visitors of this site.";
    const FOOTER: &str = "Copyright Acme Industrial Group, all rights reserved. Registered office: 1 Factory Lane, Springfield. VAT number 12345678. Terms and conditions apply to all orders placed.";

    fn page(unique: &str, with_banner: bool, with_footer: bool) -> String {
        let mut parts = Vec::new();
        if with_banner {
            parts.push(BANNER.to_string());
        }
        parts.push(format!(
            "## Page\n\n{} This paragraph is unique to the page and long enough to count as a block.",
            unique
        ));
        if with_footer {
            parts.push(FOOTER.to_string());
        }
        parts.join("\n\n")
    }

    #[test]
    fn hash_is_stable_across_whitespace_and_case() {
        assert_eq!(block_hash("Hello   World"), block_hash("hello world"));
        assert_eq!(block_hash("A  b\n c"), block_hash("a b c"));
        assert_ne!(block_hash("alpha"), block_hash("beta"));
    }

    #[test]
    fn banner_on_8_of_10_pages_is_flagged_footer_on_4_is_not() {
        let pages: Vec<String> = (0..10)
            .map(|i| page(&format!("Page number {i}."), i < 8, i < 4))
            .collect();
        let refs: Vec<&str> = pages.iter().map(String::as_str).collect();

        let analysis = analyze_domain(&refs, &BoilerplateConfig::default()).unwrap();

        assert!(analysis.boilerplate_hashes.contains(&block_hash(BANNER)));
        assert!(!analysis.boilerplate_hashes.contains(&block_hash(FOOTER)));
        assert_eq!(analysis.pages_analyzed, 10);
    }

    #[test]
    fn strip_removes_banner_preserves_footer() {
        let pages: Vec<String> = (0..10)
            .map(|i| page(&format!("Page number {i}."), i < 8, i < 4))
            .collect();
        let refs: Vec<&str> = pages.iter().map(String::as_str).collect();
        let analysis = analyze_domain(&refs, &BoilerplateConfig::default()).unwrap();

        let stripped = strip_boilerplate(&pages[0], &analysis.boilerplate_hashes, 50);
        assert!(!stripped.contains("We use cookies"));
        assert!(stripped.contains("Copyright Acme Industrial Group"));
        assert!(stripped.contains("Page number 0."));
    }

    #[test]
    fn too_few_pages_yields_no_analysis() {
        let pages = vec!["some page content"; 4];
        assert!(analyze_domain(&pages, &BoilerplateConfig::default()).is_none());
    }

    #[test]
    fn repeated_block_within_one_page_counts_once() {
        // Banner twice on each of 3 pages out of 5: 3/5 < 0.7, not flagged.
        let double_banner_page = format!("{}\n\n{}\n\nUnique filler paragraph that is long enough to be a block by itself.", BANNER, BANNER);
        let pages: Vec<String> = (0..5)
            .map(|i| {
                if i < 3 {
                    double_banner_page.clone()
                } else {
                    page(&format!("Page {i}."), false, false)
                }
            })
            .collect();
        let refs: Vec<&str> = pages.iter().map(String::as_str).collect();

        let analysis = analyze_domain(&refs, &BoilerplateConfig::default()).unwrap();
        assert!(!analysis.boilerplate_hashes.contains(&block_hash(BANNER)));
    }

    #[test]
    fn pure_boilerplate_page_strips_to_empty() {
        let pages: Vec<String> = (0..5).map(|i| page(&format!("Page {i}."), true, false)).collect();
        let refs: Vec<&str> = pages.iter().map(String::as_str).collect();
        let analysis = analyze_domain(&refs, &BoilerplateConfig::default()).unwrap();

        let stripped = strip_boilerplate(BANNER, &analysis.boilerplate_hashes, 50);
        assert_eq!(stripped, "");
    }

    #[test]
    fn short_blocks_are_ignored() {
        let blocks = split_blocks("short\n\nthis block is definitely longer than fifty characters in total length", 50);
        assert_eq!(blocks.len(), 1);
    }
}
