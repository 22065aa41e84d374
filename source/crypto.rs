// Splintermail envelope encrypt/decrypt, keypair load, HMAC, RAND. Consumed as the "OpenSSL-shaped
// crypto primitives" collaborator (SPEC_FULL.md §6); backed here by the openssl crate, whose
// Decrypter/Encrypter/PKey/Hmac/rand_bytes map closely onto the described shape. Framing: PEM
// header, base64 "V:1" lines, one "R:<hashlen>:<hash>:<keylen>:<enckey>" per recipient, "IV:", "M:"
// AES-256-GCM ciphertext, "=<tag>", PEM footer.

use crate::error::{self, Kind};
use base64::Engine as _;
use openssl::{
  encrypt::{Decrypter as RsaDecrypter, Encrypter as RsaEncrypter},
  hash::MessageDigest,
  pkey::{PKey, Private, Public},
  rsa::Padding,
  sha::sha256,
  sign::Signer,
  symm::{Cipher, Crypter, Mode},
};
use std::{fs, io::Read as _, path::Path};

const PEM_HEADER: &str = "-----BEGIN SPLINTERMAIL MESSAGE-----";
const PEM_FOOTER: &str = "-----END SPLINTERMAIL MESSAGE-----";
const AES_KEY_LEN: usize = 32;
const GCM_TAG_LEN: usize = 16;
const GCM_IV_LEN: usize = 12;

pub struct Keypair {
  private: PKey<Private>,
  public_der: Vec<u8>,
  fingerprint: [u8; 32],
}

impl Keypair {
  pub fn load(path: &Path) -> anyhow::Result<Self> {
    let pem = fs::read(path)?;
    let private = PKey::private_key_from_pem(&pem)?;
    let public = PKey::public_key_from_der(&private.public_key_to_der()?)?;
    let public_der = public.public_key_to_der()?;
    let fingerprint = sha256(&public_der);
    Ok(Self {
      private,
      public_der,
      fingerprint,
    })
  }

  pub fn fingerprint(&self) -> &[u8; 32] {
    &self.fingerprint
  }
}

#[derive(Clone)]
pub struct RecipientKey {
  pub fingerprint: [u8; 32],
  pub public: PKey<Public>,
}

impl RecipientKey {
  pub fn from_der(der: &[u8]) -> anyhow::Result<Self> {
    let public = PKey::public_key_from_der(der)?;
    Ok(Self {
      fingerprint: sha256(der),
      public,
    })
  }
}

struct Recipient {
  hash: Vec<u8>,
  enckey: Vec<u8>,
}

/// Streaming decrypter: start() parses the recipient table and IV, update() accumulates
/// ciphertext, finish() verifies the GCM tag and returns plaintext.
pub struct Decrypter {
  aes_key: Option<[u8; AES_KEY_LEN]>,
  iv: Vec<u8>,
  ciphertext: Vec<u8>,
  tag: Option<Vec<u8>>,
}

impl Decrypter {
  pub fn start(keypair: &Keypair, envelope: &str) -> error::Result<Self> {
    let body = strip_pem(envelope)?;
    let mut recipients = Vec::new();
    let mut iv = Vec::new();
    let mut ciphertext_b64 = String::new();
    let mut tag_b64 = None;

    for line in body.lines() {
      if let Some(rest) = line.strip_prefix("R:") {
        let fields: Vec<&str> = rest.splitn(4, ':').collect();
        if fields.len() != 4 {
          return Err(error::Error::msg(Kind::Parse, "malformed R: line"));
        }
        let hash = base64::engine::general_purpose::STANDARD
          .decode(fields[1])
          .map_err(|e| error::Error::new(Kind::Parse, e))?;
        let enckey = base64::engine::general_purpose::STANDARD
          .decode(fields[3])
          .map_err(|e| error::Error::new(Kind::Parse, e))?;
        recipients.push(Recipient { hash, enckey });
      } else if let Some(rest) = line.strip_prefix("IV:") {
        let fields: Vec<&str> = rest.splitn(2, ':').collect();
        if fields.len() != 2 {
          return Err(error::Error::msg(Kind::Parse, "malformed IV: line"));
        }
        iv = base64::engine::general_purpose::STANDARD
          .decode(fields[1])
          .map_err(|e| error::Error::new(Kind::Parse, e))?;
      } else if let Some(rest) = line.strip_prefix("M:") {
        ciphertext_b64.push_str(rest);
      } else if let Some(rest) = line.strip_prefix('=') {
        tag_b64 = Some(rest.to_string());
      } else if let Some(rest) = line.strip_prefix("V:1:") {
        ciphertext_b64.push_str(rest);
      }
    }

    if iv.len() != GCM_IV_LEN {
      return Err(error::Error::msg(Kind::Parse, "bad IV length"));
    }

    let recipient = recipients
      .into_iter()
      .find(|r| r.hash == keypair.fingerprint)
      .ok_or_else(|| error::Error::msg(Kind::Not4Me, "no recipient entry matches our fingerprint"))?;

    let mut rsa_decrypter = RsaDecrypter::new(&keypair.private).map_err(|e| error::Error::new(Kind::Parse, e))?;
    rsa_decrypter
      .set_rsa_padding(Padding::PKCS1_OAEP)
      .map_err(|e| error::Error::new(Kind::Parse, e))?;
    let buffer_len = rsa_decrypter
      .decrypt_len(&recipient.enckey)
      .map_err(|e| error::Error::new(Kind::Parse, e))?;
    let mut aes_key_buf = vec![0u8; buffer_len];
    let decrypted_len = rsa_decrypter
      .decrypt(&recipient.enckey, &mut aes_key_buf)
      .map_err(|e| error::Error::new(Kind::Parse, e))?;
    if decrypted_len != AES_KEY_LEN {
      return Err(error::Error::msg(Kind::Parse, "unwrapped AES key has wrong length"));
    }
    let mut aes_key = [0u8; AES_KEY_LEN];
    aes_key.copy_from_slice(&aes_key_buf[..AES_KEY_LEN]);

    let tag = tag_b64
      .map(|t| base64::engine::general_purpose::STANDARD.decode(t))
      .transpose()
      .map_err(|e| error::Error::new(Kind::Parse, e))?;
    let ciphertext = base64::engine::general_purpose::STANDARD
      .decode(ciphertext_b64.trim())
      .map_err(|e| error::Error::new(Kind::Parse, e))?;

    Ok(Self {
      aes_key: Some(aes_key),
      iv,
      ciphertext,
      tag,
    })
  }

  pub fn update(&mut self, chunk: &[u8]) {
    self.ciphertext.extend_from_slice(chunk);
  }

  pub fn finish(mut self) -> error::Result<Vec<u8>> {
    let tag = self
      .tag
      .take()
      .ok_or_else(|| error::Error::msg(Kind::Parse, "missing GCM tag"))?;
    if tag.len() != GCM_TAG_LEN {
      return Err(error::Error::msg(Kind::Parse, "bad GCM tag length"));
    }
    let aes_key = self
      .aes_key
      .take()
      .ok_or_else(|| error::Error::msg(Kind::Parse, "decrypter used after finish"))?;
    let cipher = Cipher::aes_256_gcm();
    let mut crypter = Crypter::new(cipher, Mode::Decrypt, &aes_key, Some(&self.iv))
      .map_err(|e| error::Error::new(Kind::Parse, e))?;
    let mut out = vec![0u8; self.ciphertext.len() + cipher.block_size()];
    let mut count = crypter
      .update(&self.ciphertext, &mut out)
      .map_err(|e| error::Error::new(Kind::Parse, e))?;
    crypter
      .set_tag(&tag)
      .map_err(|e| error::Error::new(Kind::Parse, e))?;
    count += crypter
      .finalize(&mut out[count..])
      .map_err(|_| error::Error::msg(Kind::Parse, "GCM tag mismatch"))?;
    out.truncate(count);
    Ok(out)
  }
}

fn strip_pem(envelope: &str) -> error::Result<String> {
  let start = envelope
    .find(PEM_HEADER)
    .ok_or_else(|| error::Error::msg(Kind::Parse, "missing PEM header"))?;
  let end = envelope
    .find(PEM_FOOTER)
    .ok_or_else(|| error::Error::msg(Kind::Parse, "missing PEM footer"))?;
  if end < start {
    return Err(error::Error::msg(Kind::Parse, "PEM footer precedes header"));
  }
  Ok(envelope[start + PEM_HEADER.len()..end].to_string())
}

/// Symmetric for upload: wraps a freshly generated AES-256-GCM key to each recipient's RSA key.
pub struct Encrypter {
  aes_key: [u8; AES_KEY_LEN],
  iv: [u8; GCM_IV_LEN],
  recipients: Vec<Recipient>,
  plaintext: Vec<u8>,
}

impl Encrypter {
  pub fn start(keys: &[RecipientKey]) -> error::Result<Self> {
    let mut aes_key = [0u8; AES_KEY_LEN];
    openssl::rand::rand_bytes(&mut aes_key).map_err(|e| error::Error::new(Kind::Parse, e))?;
    let mut iv = [0u8; GCM_IV_LEN];
    openssl::rand::rand_bytes(&mut iv).map_err(|e| error::Error::new(Kind::Parse, e))?;

    let mut recipients = Vec::with_capacity(keys.len());
    for key in keys {
      let mut rsa_encrypter = RsaEncrypter::new(&key.public).map_err(|e| error::Error::new(Kind::Parse, e))?;
      rsa_encrypter
        .set_rsa_padding(Padding::PKCS1_OAEP)
        .map_err(|e| error::Error::new(Kind::Parse, e))?;
      let buffer_len = rsa_encrypter
        .encrypt_len(&aes_key)
        .map_err(|e| error::Error::new(Kind::Parse, e))?;
      let mut enckey = vec![0u8; buffer_len];
      let n = rsa_encrypter
        .encrypt(&aes_key, &mut enckey)
        .map_err(|e| error::Error::new(Kind::Parse, e))?;
      enckey.truncate(n);
      recipients.push(Recipient {
        hash: key.fingerprint.to_vec(),
        enckey,
      });
    }

    Ok(Self {
      aes_key,
      iv,
      recipients,
      plaintext: Vec::new(),
    })
  }

  pub fn update(&mut self, chunk: &[u8]) {
    self.plaintext.extend_from_slice(chunk);
  }

  pub fn finish(self) -> error::Result<String> {
    let cipher = Cipher::aes_256_gcm();
    let mut crypter = Crypter::new(cipher, Mode::Encrypt, &self.aes_key, Some(&self.iv))
      .map_err(|e| error::Error::new(Kind::Parse, e))?;
    let mut ciphertext = vec![0u8; self.plaintext.len() + cipher.block_size()];
    let mut count = crypter
      .update(&self.plaintext, &mut ciphertext)
      .map_err(|e| error::Error::new(Kind::Parse, e))?;
    count += crypter
      .finalize(&mut ciphertext[count..])
      .map_err(|e| error::Error::new(Kind::Parse, e))?;
    ciphertext.truncate(count);
    let mut tag = vec![0u8; GCM_TAG_LEN];
    crypter
      .get_tag(&mut tag)
      .map_err(|e| error::Error::new(Kind::Parse, e))?;

    let mut out = String::new();
    out.push_str(PEM_HEADER);
    out.push('\n');
    for recipient in &self.recipients {
      out.push_str(&format!(
        "R:{}:{}:{}:{}\n",
        recipient.hash.len(),
        base64::engine::general_purpose::STANDARD.encode(&recipient.hash),
        recipient.enckey.len(),
        base64::engine::general_purpose::STANDARD.encode(&recipient.enckey),
      ));
    }
    out.push_str(&format!(
      "IV:{}:{}\n",
      self.iv.len(),
      base64::engine::general_purpose::STANDARD.encode(self.iv)
    ));
    out.push_str("M:");
    out.push_str(&base64::engine::general_purpose::STANDARD.encode(&ciphertext));
    out.push('\n');
    out.push('=');
    out.push_str(&base64::engine::general_purpose::STANDARD.encode(&tag));
    out.push('\n');
    out.push_str(PEM_FOOTER);
    Ok(out)
  }
}

pub fn random_bytes(n: usize) -> error::Result<Vec<u8>> {
  let mut buf = vec![0u8; n];
  openssl::rand::rand_bytes(&mut buf).map_err(|e| error::Error::new(Kind::Parse, e))?;
  Ok(buf)
}

pub fn hmac(key: &[u8], message: &[u8]) -> error::Result<[u8; 64]> {
  let pkey = PKey::hmac(key).map_err(|e| error::Error::new(Kind::Parse, e))?;
  let mut signer = Signer::new(MessageDigest::sha512(), &pkey).map_err(|e| error::Error::new(Kind::Parse, e))?;
  signer.update(message).map_err(|e| error::Error::new(Kind::Parse, e))?;
  let digest = signer.sign_to_vec().map_err(|e| error::Error::new(Kind::Parse, e))?;
  let mut out = [0u8; 64];
  out.copy_from_slice(&digest[..64]);
  Ok(out)
}

/// Reads a directory of peers' public keys (PEM, one per file) for the Encrypter's recipient set.
/// Grounded on original_source/citm/keysync.c: the proxy periodically reloads this directory so
/// newly added devices' keys are picked up without a restart.
pub fn load_recipient_keys(dir: &Path) -> anyhow::Result<Vec<RecipientKey>> {
  let mut keys = Vec::new();
  if !dir.is_dir() {
    return Ok(keys);
  }
  for entry in fs::read_dir(dir)? {
    let entry = entry?;
    if entry.path().extension().and_then(|e| e.to_str()) != Some("pem") {
      continue;
    }
    let mut pem = Vec::new();
    fs::File::open(entry.path())?.read_to_end(&mut pem)?;
    let public = PKey::public_key_from_pem(&pem)?;
    let der = public.public_key_to_der()?;
    keys.push(RecipientKey::from_der(&der)?);
  }
  Ok(keys)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn hmac_is_deterministic() {
    let a = hmac(b"key", b"message").unwrap();
    let b = hmac(b"key", b"message").unwrap();
    assert_eq!(a, b);
  }

  #[test]
  fn random_bytes_have_requested_length() {
    assert_eq!(32, random_bytes(32).unwrap().len());
  }

  #[test]
  fn strip_pem_requires_both_markers() {
    assert!(strip_pem("no markers here").is_err());
    let wrapped = format!("{PEM_HEADER}\nbody\n{PEM_FOOTER}");
    assert_eq!("\nbody\n", strip_pem(&wrapped).unwrap());
  }
}
