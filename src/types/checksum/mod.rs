/// CRC32 of an image body, domain-separated by its four byte magic.
pub fn image_crc32(magic: &[u8; 4], body: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(magic);
    hasher.update(body);
    hasher.finalize()
}
