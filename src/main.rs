use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand, ValueEnum};
mod secret;
use se3core::algo::{flags, id, mode};
use se3core::crypto::payload::{AUTH_LEN, IV_LEN};
use se3core::crypto::{self, AES_BLOCK_LEN, AES_KEY_MAX, DIGEST_LEN, PayloadCipher};
use se3core::proto::{
    self, CryptoInitReq, CryptoInitResp, CryptoUpdateReq, KeyEditReq, KeyListReq, KeyOp,
    SetTimeReq, cmd,
};
use se3core::records::RECORD_SIZE;
use se3core::rng::{OsRandom, Random};
use se3core::{KEY_INVALID, SessionConfig, Storage, Token, default_storage, status};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Bytes sent per update request.
const CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FeedbackArg {
    Ecb,
    Cbc,
    Ofb,
    Ctr,
    Cfb,
}

impl FeedbackArg {
    fn mode_bits(self) -> u16 {
        match self {
            FeedbackArg::Ecb => mode::ECB,
            FeedbackArg::Cbc => mode::CBC,
            FeedbackArg::Ofb => mode::OFB,
            FeedbackArg::Ctr => mode::CTR,
            FeedbackArg::Cfb => mode::CFB,
        }
    }
}

#[derive(Debug, clap::Args)]
struct CipherArgs {
    /// Id of the AES key
    #[arg(long)]
    key: u32,

    /// Chaining mode
    #[arg(long, value_enum, default_value_t = FeedbackArg::Cbc)]
    feedback: FeedbackArg,

    /// Authenticate with HMAC-SHA-256 (AES_HMACSHA256 sessions)
    #[arg(long, default_value_t = false)]
    auth: bool,

    input: PathBuf,
    output: PathBuf,
}

fn resolve_storage(path: Option<PathBuf>) -> Result<Storage> {
    match path {
        Some(p) => Ok(Storage::new(p)),
        None => default_storage(),
    }
}

#[derive(Debug, Parser)]
#[command(name = "se3core")]
#[command(
    version,
    about = "Secure-element core of a USB crypto token, emulated over a flash image file."
)]
struct Cli {
    /// Path to the flash image
    #[arg(long, global = true, value_name = "PATH", env = "SE3_IMAGE")]
    image: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Creates a blank, formatted flash image
    Format,

    /// Shows flash usage
    Info {
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Stores a key read as hex from SE3_KEY_HEX, stdin or a prompt
    #[command(arg_required_else_help = true)]
    KeyAdd {
        id: u32,

        #[arg(long, default_value = "")]
        name: String,

        /// Key expires this many days from now
        #[arg(long)]
        valid_days: Option<i64>,

        /// Generate LEN random bytes instead of reading key material
        #[arg(long, value_name = "LEN")]
        random: Option<usize>,

        /// Replace an existing key with the same id
        #[arg(long, default_value_t = false)]
        replace: bool,
    },

    /// Deletes a key
    #[command(arg_required_else_help = true)]
    KeyRemove { id: u32 },

    /// Lists keys with salted fingerprints
    Keys {
        /// Hex salt for the fingerprints (32 bytes, default all zero)
        #[arg(long)]
        salt: Option<String>,

        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Stores a 32-byte record given as hex
    #[command(arg_required_else_help = true)]
    RecordSet {
        kind: u16,
        #[arg(value_name = "HEX")]
        data: String,
    },

    /// Prints a record as hex
    #[command(arg_required_else_help = true)]
    RecordGet { kind: u16 },

    /// Lists the supported algorithms
    Algos {
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// SHA-256 of a file
    #[command(arg_required_else_help = true)]
    Digest { file: PathBuf },

    /// HMAC-SHA-256 of a file under a stored key
    #[command(arg_required_else_help = true)]
    Hmac {
        #[arg(long)]
        key: u32,
        file: PathBuf,
    },

    /// Encrypts a file; the output is IV || ciphertext [|| tag]
    #[command(arg_required_else_help = true)]
    Encrypt {
        #[command(flatten)]
        cipher: CipherArgs,
    },

    /// Decrypts a file produced by `encrypt`
    #[command(arg_required_else_help = true)]
    Decrypt {
        #[command(flatten)]
        cipher: CipherArgs,
    },

    /// Wraps a file as a host transport payload under a 32-byte session key
    /// read like `key-add` key material; the output is IV || tag || ciphertext
    #[command(arg_required_else_help = true)]
    Seal { input: PathBuf, output: PathBuf },

    /// Authenticates and unwraps a file produced by `seal`
    #[command(arg_required_else_help = true)]
    Unseal { input: PathBuf, output: PathBuf },
}

#[derive(Serialize)]
struct KeyRow {
    id: u32,
    expires: Option<String>,
    length: u16,
    name: String,
    fingerprint: String,
}

fn status_name(code: u16) -> &'static str {
    match code {
        status::HW => "hardware error",
        status::COMMAND => "unknown command",
        status::PARAMS => "invalid parameters",
        status::RESOURCE => "not found",
        status::MEMORY => "out of memory",
        status::EXPIRED => "key expired",
        status::AUTH => "authentication failed",
        _ => "unknown error",
    }
}

/// Sends one request and fails on a non-OK status.
fn call(token: &mut Token, command: u16, req: &[u8]) -> Result<Vec<u8>> {
    let (code, resp) = token.handle(command, req);
    if code != status::OK {
        bail!("{} (status {code:#06x})", status_name(code));
    }
    Ok(resp)
}

fn now() -> u32 {
    u32::try_from(Utc::now().timestamp()).unwrap_or(u32::MAX)
}

fn format_validity(validity: u32) -> Option<String> {
    if validity == u32::MAX {
        return None;
    }
    DateTime::<Utc>::from_timestamp(i64::from(validity), 0)
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
}

/// Opens a session, feeds `data` in chunks and returns the concatenated output.
///
/// `first` is added to the first update, `last` to the final one (which also
/// carries FINIT).
fn run_session(
    token: &mut Token,
    init: CryptoInitReq,
    first: (u16, &[u8]),
    data: &[u8],
    last: u16,
) -> Result<Vec<u8>> {
    call(token, cmd::CRYPTO_SET_TIME, &SetTimeReq { devtime: now() }.to_bytes())?;
    let resp = call(token, cmd::CRYPTO_INIT, &init.to_bytes())?;
    let sid = CryptoInitResp::from_bytes(&resp)?.sid;

    let digest = init.algo == id::SHA256 || init.algo == id::HMACSHA256;
    let mut chunks: Vec<&[u8]> = data.chunks(CHUNK).collect();
    if chunks.is_empty() {
        chunks.push(&[]);
    }

    let mut out = Vec::new();
    let count = chunks.len();
    for (i, chunk) in chunks.into_iter().enumerate() {
        let mut update_flags = 0;
        let mut datain1: &[u8] = &[];
        if i == 0 {
            update_flags |= first.0;
            datain1 = first.1;
        }
        if i + 1 == count {
            update_flags |= last | flags::FINIT;
        }
        let (datain1, datain2) = if digest { (chunk, &[][..]) } else { (datain1, chunk) };

        let req = CryptoUpdateReq {
            sid,
            flags: update_flags,
            datain1,
            datain2,
        };
        let resp = call(token, cmd::CRYPTO_UPDATE, &req.to_bytes())?;
        out.extend_from_slice(proto::decode_update_resp(&resp)?);
    }
    Ok(out)
}

fn pkcs7_pad(data: &[u8]) -> Vec<u8> {
    let pad = AES_BLOCK_LEN - data.len() % AES_BLOCK_LEN;
    let mut out = data.to_vec();
    out.resize(data.len() + pad, pad as u8);
    out
}

fn pkcs7_unpad(mut data: Vec<u8>) -> Result<Vec<u8>> {
    let pad = usize::from(*data.last().context("empty plaintext")?);
    if pad == 0 || pad > AES_BLOCK_LEN || pad > data.len() {
        bail!("bad padding; wrong key or mode?");
    }
    if data[data.len() - pad..].iter().any(|&b| usize::from(b) != pad) {
        bail!("bad padding; wrong key or mode?");
    }
    data.truncate(data.len() - pad);
    Ok(data)
}

fn encrypt(token: &mut Token, args: &CipherArgs) -> Result<()> {
    let plain = Zeroizing::new(fs::read(&args.input)?);
    let padded = Zeroizing::new(pkcs7_pad(&plain));

    let mut iv = [0u8; AES_BLOCK_LEN];
    OsRandom.random(&mut iv)?;

    let (algo_id, first, last) = if args.auth {
        (id::AES_HMACSHA256, flags::RESET, flags::AUTH)
    } else {
        (id::AES, flags::SETIV, 0)
    };
    let init = CryptoInitReq {
        algo: algo_id,
        mode: args.feedback.mode_bits() | mode::ENCRYPT,
        key_id: args.key,
    };
    let out = run_session(token, init, (first, &iv), &padded, last)?;

    let mut file = iv.to_vec();
    file.extend_from_slice(&out);
    fs::write(&args.output, file)?;
    Ok(())
}

fn decrypt(token: &mut Token, args: &CipherArgs) -> Result<()> {
    let file = fs::read(&args.input)?;
    let tag_len = if args.auth { DIGEST_LEN } else { 0 };
    if file.len() < 2 * AES_BLOCK_LEN + tag_len {
        bail!("{} is too short", args.input.display());
    }
    let (iv, rest) = file.split_at(AES_BLOCK_LEN);
    let (ciphertext, tag) = rest.split_at(rest.len() - tag_len);

    let (algo_id, first, last) = if args.auth {
        (id::AES_HMACSHA256, flags::RESET, flags::AUTH)
    } else {
        (id::AES, flags::SETIV, 0)
    };
    let init = CryptoInitReq {
        algo: algo_id,
        mode: args.feedback.mode_bits() | mode::DECRYPT,
        key_id: args.key,
    };
    let mut out = run_session(token, init, (first, iv), ciphertext, last)?;

    if args.auth {
        let computed = out.split_off(out.len() - DIGEST_LEN);
        crypto::verify_tag(tag, &computed).context("ciphertext was modified")?;
    }
    let plain = Zeroizing::new(pkcs7_unpad(out)?);
    fs::write(&args.output, &*plain)?;
    Ok(())
}

fn payload_cipher() -> Result<PayloadCipher> {
    let material = secret::read_key_material()?;
    let key: &[u8; AES_KEY_MAX] = material
        .as_slice()
        .try_into()
        .with_context(|| format!("session key must be {AES_KEY_MAX} bytes"))?;
    Ok(PayloadCipher::new(key)?)
}

fn seal(input: &Path, output: &Path) -> Result<()> {
    let cipher = payload_cipher()?;
    let plain = Zeroizing::new(fs::read(input)?);
    let mut data = Zeroizing::new(pkcs7_pad(&plain));
    let (iv, auth) = cipher.seal(&mut OsRandom, &mut data)?;

    let mut file = Vec::with_capacity(IV_LEN + AUTH_LEN + data.len());
    file.extend_from_slice(&iv);
    file.extend_from_slice(&auth);
    file.extend_from_slice(&data);
    fs::write(output, file)?;
    Ok(())
}

fn unseal(input: &Path, output: &Path) -> Result<()> {
    let cipher = payload_cipher()?;
    let file = fs::read(input)?;
    let body = file.len().saturating_sub(IV_LEN + AUTH_LEN);
    if body == 0 || body % AES_BLOCK_LEN != 0 {
        bail!("{} is not a sealed payload", input.display());
    }
    let (iv, rest) = file.split_at(IV_LEN);
    let (auth, ciphertext) = rest.split_at(AUTH_LEN);
    let iv: &[u8; IV_LEN] = iv.try_into()?;
    let auth: &[u8; AUTH_LEN] = auth.try_into()?;

    let mut data = ciphertext.to_vec();
    cipher
        .decrypt(iv, &mut data, auth)
        .context("payload was modified or the key is wrong")?;
    let plain = Zeroizing::new(pkcs7_unpad(data)?);
    fs::write(output, &*plain)?;
    Ok(())
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Cli::parse();
    let storage = resolve_storage(args.image.clone())?;
    let config = SessionConfig::default();

    let open = || Token::open_with_storage(storage.clone(), config);

    match args.command {
        Commands::Format => {
            Token::format_with_storage(storage.clone(), config)?;
            println!("flash image formatted");
        }
        Commands::Info { json } => {
            let token = open()?;
            let stats = token.info()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("image:          {}", token.storage().path().display());
                println!("active sector:  {}", stats.sector);
                println!("live nodes:     {}", stats.nodes);
                println!("used bytes:     {}", stats.used);
                println!("allocated:      {}", stats.allocated);
                println!("free bytes:     {}", stats.free);
                if stats.hw_error {
                    println!("hardware error flag set");
                }
            }
        }
        Commands::KeyAdd {
            id,
            name,
            valid_days,
            random,
            replace,
        } => {
            let mut token = open()?;
            let material = match random {
                Some(len) => {
                    let mut buf = Zeroizing::new(vec![0u8; len]);
                    OsRandom.random(&mut buf)?;
                    buf
                }
                None => secret::read_key_material()?,
            };
            let validity = match valid_days {
                Some(days) => {
                    let expires = Utc::now()
                        + Duration::try_days(days).context("validity out of range")?;
                    u32::try_from(expires.timestamp()).context("expiry out of range")?
                }
                None => u32::MAX,
            };
            let req = KeyEditReq {
                op: if replace { KeyOp::Upsert } else { KeyOp::Insert },
                id,
                validity,
                data: &material,
                name: name.as_bytes(),
            };
            call(&mut token, cmd::KEY_EDIT, &req.to_bytes())
                .with_context(|| format!("cannot store key {id}"))?;
            token.save()?;
            println!("stored key {id} ({} bytes)", material.len());
        }
        Commands::KeyRemove { id } => {
            let mut token = open()?;
            let req = KeyEditReq {
                op: KeyOp::Delete,
                id,
                validity: 0,
                data: &[],
                name: &[],
            };
            call(&mut token, cmd::KEY_EDIT, &req.to_bytes())
                .with_context(|| format!("cannot remove key {id}"))?;
            token.save()?;
            println!("key {id} removed");
        }
        Commands::Keys { salt, json } => {
            let mut token = open()?;
            let mut salt_bytes = [0u8; DIGEST_LEN];
            if let Some(hex_salt) = salt {
                let decoded = hex::decode(hex_salt).context("salt must be hex")?;
                if decoded.len() != DIGEST_LEN {
                    bail!("salt must be {DIGEST_LEN} bytes");
                }
                salt_bytes.copy_from_slice(&decoded);
            }

            let mut rows = Vec::new();
            loop {
                let req = KeyListReq {
                    skip: u16::try_from(rows.len()).context("too many keys")?,
                    max: u16::MAX,
                    salt: salt_bytes,
                };
                let resp = call(&mut token, cmd::KEY_LIST, &req.to_bytes())?;
                let page = proto::decode_key_list(&resp)?;
                if page.is_empty() {
                    break;
                }
                rows.extend(page.into_iter().map(|k| KeyRow {
                    id: k.id,
                    expires: format_validity(k.validity),
                    length: k.data_len,
                    name: String::from_utf8_lossy(&k.name).into_owned(),
                    fingerprint: hex::encode(k.fingerprint),
                }));
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if rows.is_empty() {
                println!("No keys stored.");
            } else {
                for row in rows {
                    println!(
                        "{:>10}  {:>4}  {:<16}  {:<16}  {}",
                        row.id,
                        row.length,
                        row.expires.as_deref().unwrap_or("never"),
                        row.name,
                        &row.fingerprint[..16]
                    );
                }
            }
        }
        Commands::RecordSet { kind, data } => {
            let mut token = open()?;
            let decoded = Zeroizing::new(hex::decode(data).context("record must be hex")?);
            let data: [u8; RECORD_SIZE] = decoded
                .as_slice()
                .try_into()
                .with_context(|| format!("record must be {RECORD_SIZE} bytes"))?;
            token.core_mut().record_set(kind, &data)?;
            token.save()?;
            println!("record {kind} stored");
        }
        Commands::RecordGet { kind } => {
            let token = open()?;
            match token.core().record_get(kind)? {
                Some(data) => println!("{}", hex::encode(&data[..])),
                None => bail!("record {kind} not found"),
            }
        }
        Commands::Algos { json } => {
            let mut token = open()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&token.core().crypto_list())?);
            } else {
                let resp = call(&mut token, cmd::CRYPTO_LIST, &[])?;
                for entry in proto::decode_algo_list(&resp)? {
                    let sizes: Vec<String> = entry
                        .key_sizes
                        .iter()
                        .filter(|&&s| s != 0)
                        .map(|s| (s * 8).to_string())
                        .collect();
                    println!(
                        "{:<16} type={} block={:<3} keys={}",
                        entry.name,
                        entry.kind,
                        entry.block_size,
                        if sizes.is_empty() { "-".to_string() } else { sizes.join("/") }
                    );
                }
            }
        }
        Commands::Digest { file } => {
            let mut token = open()?;
            let data = fs::read(&file)?;
            let init = CryptoInitReq {
                algo: id::SHA256,
                mode: 0,
                key_id: KEY_INVALID,
            };
            let digest = run_session(&mut token, init, (0, &[]), &data, 0)?;
            println!("{}  {}", hex::encode(digest), file.display());
        }
        Commands::Hmac { key, file } => {
            let mut token = open()?;
            let data = fs::read(&file)?;
            let init = CryptoInitReq {
                algo: id::HMACSHA256,
                mode: 0,
                key_id: key,
            };
            let mac = run_session(&mut token, init, (0, &[]), &data, 0)?;
            println!("{}  {}", hex::encode(mac), file.display());
        }
        Commands::Encrypt { cipher } => {
            let mut token = open()?;
            encrypt(&mut token, &cipher)?;
            println!("encrypted {}", cipher.output.display());
        }
        Commands::Decrypt { cipher } => {
            let mut token = open()?;
            decrypt(&mut token, &cipher)?;
            println!("decrypted {}", cipher.output.display());
        }
        Commands::Seal { input, output } => {
            seal(&input, &output)?;
            println!("sealed {}", output.display());
        }
        Commands::Unseal { input, output } => {
            unseal(&input, &output)?;
            println!("unsealed {}", output.display());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkcs7_roundtrip() {
        for len in [0, 1, 15, 16, 17, 40] {
            let data = vec![0xAB; len];
            let padded = pkcs7_pad(&data);
            assert_eq!(padded.len() % AES_BLOCK_LEN, 0);
            assert!(padded.len() > len);
            assert_eq!(pkcs7_unpad(padded).unwrap(), data);
        }
    }

    #[test]
    fn pkcs7_rejects_garbage() {
        assert!(pkcs7_unpad(vec![0u8; 16]).is_err());
        assert!(pkcs7_unpad(vec![17u8; 16]).is_err());
        let mut bad = vec![4u8; 16];
        bad[13] = 1;
        assert!(pkcs7_unpad(bad).is_err());
    }

    #[test]
    fn feedback_args_map_to_mode_bits() {
        assert_eq!(FeedbackArg::Cbc.mode_bits(), mode::CBC);
        assert!(se3core::algo::parse_mode(FeedbackArg::Ctr.mode_bits()).is_ok());
    }
}
