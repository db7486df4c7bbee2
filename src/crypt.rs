//! Packet cipher selection and key derivation.
//!
//! The pre-shared key is expanded with PBKDF2-HMAC-SHA1 (salt `kcp-go`,
//! 4096 rounds) into 32 bytes, then truncated per cipher. Block ciphers
//! run in CFB keyed by a per-packet nonce; `salsa20` consumes the first
//! 8 nonce bytes; `xor` applies a derived pad; `none` is a pass-through
//! object and `null` means no cipher object at all.
use cipher::generic_array::GenericArray;
use cipher::{BlockEncrypt, BlockSizeUser, KeyInit, KeyIvInit, StreamCipher};
use pbkdf2::pbkdf2_hmac;
use sha1::Sha1;
use tracing::warn;

/// PBKDF2 salt, fixed by the wire protocol.
pub const SALT: &[u8] = b"kcp-go";

/// PBKDF2 iteration count.
const KEY_ROUNDS: u32 = 4096;

/// Per-packet nonce length prepended to encrypted packets.
pub const NONCE_SIZE: usize = 16;

/// Largest block size among the supported ciphers.
const MAX_BLOCK: usize = 16;

/// Expand the passphrase into the 32-byte master key.
pub fn derive_key(key: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    pbkdf2_hmac::<Sha1>(key.as_bytes(), SALT, KEY_ROUNDS, &mut out);
    out
}

/// A packet cipher. Implementations are stateless across packets: all
/// per-packet variability comes from the nonce.
pub trait BlockCrypt: Send + Sync {
    fn encrypt(&self, nonce: &[u8; NONCE_SIZE], buf: &mut [u8]);
    fn decrypt(&self, nonce: &[u8; NONCE_SIZE], buf: &mut [u8]);
}

/// One raw block-cipher primitive, object-safe so the CFB wrapper can
/// hold any of them.
trait BlockFn: Send + Sync {
    fn block_len(&self) -> usize;
    fn encrypt_block(&self, block: &mut [u8]);
}

macro_rules! impl_block_fn {
    ($ty:ty) => {
        impl BlockFn for $ty {
            fn block_len(&self) -> usize {
                <$ty as BlockSizeUser>::block_size()
            }

            fn encrypt_block(&self, block: &mut [u8]) {
                let block = GenericArray::from_mut_slice(block);
                BlockEncrypt::encrypt_block(self, block);
            }
        }
    };
}

impl_block_fn!(aes::Aes128);
impl_block_fn!(aes::Aes192);
impl_block_fn!(aes::Aes256);
impl_block_fn!(blowfish::Blowfish);
impl_block_fn!(twofish::Twofish);
impl_block_fn!(cast5::Cast5);
impl_block_fn!(des::TdesEde3);
impl_block_fn!(sm4::Sm4);

const TEA_DELTA: u32 = 0x9e37_79b9;
const TEA_ROUNDS: u32 = 32;

/// TEA with a 16-byte key and 64-bit blocks. Not provided by the cipher
/// crates we already carry, so the block function lives here.
struct Tea {
    key: [u32; 4],
}

impl Tea {
    fn new(key: &[u8]) -> Self {
        Self { key: key_words(key) }
    }
}

impl BlockFn for Tea {
    fn block_len(&self) -> usize {
        8
    }

    fn encrypt_block(&self, block: &mut [u8]) {
        let (mut v0, mut v1) = load_block(block);
        let [k0, k1, k2, k3] = self.key;
        let mut sum = 0u32;
        for _ in 0..TEA_ROUNDS {
            sum = sum.wrapping_add(TEA_DELTA);
            v0 = v0.wrapping_add(
                (v1 << 4).wrapping_add(k0) ^ v1.wrapping_add(sum) ^ (v1 >> 5).wrapping_add(k1),
            );
            v1 = v1.wrapping_add(
                (v0 << 4).wrapping_add(k2) ^ v0.wrapping_add(sum) ^ (v0 >> 5).wrapping_add(k3),
            );
        }
        store_block(block, v0, v1);
    }
}

/// XTEA, same shape as [`Tea`].
struct Xtea {
    key: [u32; 4],
}

impl Xtea {
    fn new(key: &[u8]) -> Self {
        Self { key: key_words(key) }
    }
}

impl BlockFn for Xtea {
    fn block_len(&self) -> usize {
        8
    }

    fn encrypt_block(&self, block: &mut [u8]) {
        let (mut v0, mut v1) = load_block(block);
        let mut sum = 0u32;
        for _ in 0..TEA_ROUNDS {
            v0 = v0.wrapping_add(
                ((v1 << 4) ^ (v1 >> 5)).wrapping_add(v1)
                    ^ sum.wrapping_add(self.key[(sum & 3) as usize]),
            );
            sum = sum.wrapping_add(TEA_DELTA);
            v1 = v1.wrapping_add(
                ((v0 << 4) ^ (v0 >> 5)).wrapping_add(v0)
                    ^ sum.wrapping_add(self.key[((sum >> 11) & 3) as usize]),
            );
        }
        store_block(block, v0, v1);
    }
}

fn key_words(key: &[u8]) -> [u32; 4] {
    let mut words = [0u32; 4];
    for (i, word) in words.iter_mut().enumerate() {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&key[i * 4..i * 4 + 4]);
        *word = u32::from_be_bytes(bytes);
    }
    words
}

fn load_block(block: &[u8]) -> (u32, u32) {
    let mut a = [0u8; 4];
    let mut b = [0u8; 4];
    a.copy_from_slice(&block[..4]);
    b.copy_from_slice(&block[4..8]);
    (u32::from_be_bytes(a), u32::from_be_bytes(b))
}

fn store_block(block: &mut [u8], v0: u32, v1: u32) {
    block[..4].copy_from_slice(&v0.to_be_bytes());
    block[4..8].copy_from_slice(&v1.to_be_bytes());
}

/// CFB mode over any [`BlockFn`]; the nonce seeds the IV.
struct CfbCrypt {
    cipher: Box<dyn BlockFn>,
}

impl BlockCrypt for CfbCrypt {
    fn encrypt(&self, nonce: &[u8; NONCE_SIZE], buf: &mut [u8]) {
        let bs = self.cipher.block_len();
        let mut iv = [0u8; MAX_BLOCK];
        iv[..bs].copy_from_slice(&nonce[..bs]);
        let mut pos = 0;
        while pos < buf.len() {
            let mut ks = [0u8; MAX_BLOCK];
            ks[..bs].copy_from_slice(&iv[..bs]);
            self.cipher.encrypt_block(&mut ks[..bs]);
            let take = bs.min(buf.len() - pos);
            for i in 0..take {
                buf[pos + i] ^= ks[i];
            }
            iv[..take].copy_from_slice(&buf[pos..pos + take]);
            pos += take;
        }
    }

    fn decrypt(&self, nonce: &[u8; NONCE_SIZE], buf: &mut [u8]) {
        let bs = self.cipher.block_len();
        let mut iv = [0u8; MAX_BLOCK];
        iv[..bs].copy_from_slice(&nonce[..bs]);
        let mut pos = 0;
        while pos < buf.len() {
            let mut ks = [0u8; MAX_BLOCK];
            ks[..bs].copy_from_slice(&iv[..bs]);
            self.cipher.encrypt_block(&mut ks[..bs]);
            let take = bs.min(buf.len() - pos);
            for i in 0..take {
                let ct = buf[pos + i];
                buf[pos + i] = ct ^ ks[i];
                iv[i] = ct;
            }
            pos += take;
        }
    }
}

struct Salsa20Crypt {
    key: [u8; 32],
}

impl BlockCrypt for Salsa20Crypt {
    fn encrypt(&self, nonce: &[u8; NONCE_SIZE], buf: &mut [u8]) {
        let mut cipher = salsa20::Salsa20::new(
            GenericArray::from_slice(&self.key),
            GenericArray::from_slice(&nonce[..8]),
        );
        cipher.apply_keystream(buf);
    }

    fn decrypt(&self, nonce: &[u8; NONCE_SIZE], buf: &mut [u8]) {
        self.encrypt(nonce, buf);
    }
}

/// Repeating-pad XOR. The pad is a second PBKDF2 expansion so it differs
/// from the master key bytes on the wire.
struct XorCrypt {
    pad: [u8; 32],
}

impl XorCrypt {
    fn new(key: &[u8; 32]) -> Self {
        let mut pad = [0u8; 32];
        pbkdf2_hmac::<Sha1>(key, SALT, 32, &mut pad);
        Self { pad }
    }

    fn apply(&self, buf: &mut [u8]) {
        for (i, b) in buf.iter_mut().enumerate() {
            *b ^= self.pad[i % self.pad.len()];
        }
    }
}

impl BlockCrypt for XorCrypt {
    fn encrypt(&self, _nonce: &[u8; NONCE_SIZE], buf: &mut [u8]) {
        self.apply(buf);
    }

    fn decrypt(&self, _nonce: &[u8; NONCE_SIZE], buf: &mut [u8]) {
        self.apply(buf);
    }
}

/// Pass-through cipher: packets keep the nonce/checksum framing but the
/// body is not transformed.
struct NoneCrypt;

impl BlockCrypt for NoneCrypt {
    fn encrypt(&self, _nonce: &[u8; NONCE_SIZE], _buf: &mut [u8]) {}
    fn decrypt(&self, _nonce: &[u8; NONCE_SIZE], _buf: &mut [u8]) {}
}

fn cfb<C>(key: &[u8]) -> Result<Option<Box<dyn BlockCrypt>>, cipher::InvalidLength>
where
    C: KeyInit + BlockFn + 'static,
{
    let primitive = C::new_from_slice(key)?;
    Ok(Some(Box::new(CfbCrypt {
        cipher: Box::new(primitive),
    })))
}

/// Build the packet cipher named by `crypt`. `None` means packets go out
/// raw: either `null` was requested or a constructor rejected the key.
/// The tunnel still dials in that case, it just runs in cleartext.
pub fn new_block_crypt(crypt: &str, key: &[u8; 32]) -> Option<Box<dyn BlockCrypt>> {
    let built = match crypt {
        "null" => Ok(None),
        "none" => Ok(Some(Box::new(NoneCrypt) as Box<dyn BlockCrypt>)),
        "xor" => Ok(Some(Box::new(XorCrypt::new(key)) as Box<dyn BlockCrypt>)),
        "salsa20" => Ok(Some(Box::new(Salsa20Crypt { key: *key }) as Box<dyn BlockCrypt>)),
        "tea" => Ok(Some(Box::new(CfbCrypt {
            cipher: Box::new(Tea::new(&key[..16])),
        }) as Box<dyn BlockCrypt>)),
        "xtea" => Ok(Some(Box::new(CfbCrypt {
            cipher: Box::new(Xtea::new(&key[..16])),
        }) as Box<dyn BlockCrypt>)),
        "sm4" => cfb::<sm4::Sm4>(&key[..16]),
        "cast5" => cfb::<cast5::Cast5>(&key[..16]),
        "3des" => cfb::<des::TdesEde3>(&key[..24]),
        "aes-128" => cfb::<aes::Aes128>(&key[..16]),
        "aes-192" => cfb::<aes::Aes192>(&key[..24]),
        "blowfish" => cfb::<blowfish::Blowfish>(key),
        "twofish" => cfb::<twofish::Twofish>(key),
        "aes" => cfb::<aes::Aes256>(key),
        other => {
            warn!("unknown cipher {:?}, falling back to aes", other);
            cfb::<aes::Aes256>(key)
        }
    };
    match built {
        Ok(block) => block,
        Err(e) => {
            warn!("cipher init failed: {}, continuing without encryption", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_CIPHERS: &[&str] = &[
        "aes", "aes-128", "aes-192", "salsa20", "blowfish", "twofish", "cast5", "3des", "tea",
        "xtea", "xor", "sm4", "none",
    ];

    #[test]
    fn test_derive_key_is_deterministic() {
        let a = derive_key("it's a secrect");
        let b = derive_key("it's a secrect");
        let c = derive_key("another one");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_null_has_no_cipher() {
        let key = derive_key("k");
        assert!(new_block_crypt("null", &key).is_none());
    }

    #[test]
    fn test_none_is_passthrough() {
        let key = derive_key("k");
        let crypt = new_block_crypt("none", &key).unwrap();
        let nonce = [7u8; NONCE_SIZE];
        let mut buf = b"hello world".to_vec();
        crypt.encrypt(&nonce, &mut buf);
        assert_eq!(buf, b"hello world");
    }

    #[test]
    fn test_all_ciphers_round_trip() {
        let key = derive_key("round trip");
        let nonce = [0x5au8; NONCE_SIZE];
        // odd length to exercise partial final blocks
        let plaintext: Vec<u8> = (0..=254u8).collect();

        for name in ALL_CIPHERS {
            let crypt = new_block_crypt(name, &key)
                .unwrap_or_else(|| panic!("cipher {} failed to build", name));
            let mut buf = plaintext.clone();
            crypt.encrypt(&nonce, &mut buf);
            if *name != "none" {
                assert_ne!(buf, plaintext, "cipher {} left data unchanged", name);
            }
            crypt.decrypt(&nonce, &mut buf);
            assert_eq!(buf, plaintext, "cipher {} did not round-trip", name);
        }
    }

    #[test]
    fn test_nonce_changes_ciphertext() {
        let key = derive_key("nonce");
        let crypt = new_block_crypt("aes", &key).unwrap();
        let mut a = vec![0u8; 64];
        let mut b = vec![0u8; 64];
        crypt.encrypt(&[1u8; NONCE_SIZE], &mut a);
        crypt.encrypt(&[2u8; NONCE_SIZE], &mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn test_unknown_cipher_matches_aes() {
        let key = derive_key("fallback");
        let aes = new_block_crypt("aes", &key).unwrap();
        let unknown = new_block_crypt("definitely-not-a-cipher", &key).unwrap();
        let nonce = [3u8; NONCE_SIZE];
        let mut a = b"same bytes".to_vec();
        let mut b = b"same bytes".to_vec();
        aes.encrypt(&nonce, &mut a);
        unknown.encrypt(&nonce, &mut b);
        assert_eq!(a, b);
    }
}
