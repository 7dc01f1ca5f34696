use digest::Digest;
use log::debug;
use md5::Md5;

/// 由 URL 与目标路径生成稳定的任务 id
pub fn generate_id(url: &str, path: &str) -> u32 {
    let mut hasher = Md5::new();
    hasher.update(url.as_bytes());
    hasher.update(path.as_bytes());
    let digest = hasher.finalize();

    let id = digest
        .chunks(4)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .fold(0u32, |acc, word| acc ^ word);

    debug!("[Identity] {} + {} -> {}", url, path, id);
    id
}
