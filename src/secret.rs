use anyhow::{Context, Result, bail};
use std::io::{self, IsTerminal};
use zeroize::Zeroizing;

/// Reads hex-encoded key material for `key-add`.
pub fn read_key_material() -> Result<Zeroizing<Vec<u8>>> {
    //  Environment variable
    //  SE3_KEY_HEX=00112233... se3core key-add 1
    if let Ok(hex_key) = std::env::var("SE3_KEY_HEX") {
        let hex_key = Zeroizing::new(hex_key);
        if !hex_key.is_empty() {
            return decode(&hex_key);
        }
    }

    //  stdin (pipeline)
    //  echo 00112233... | se3core key-add 1
    if !io::stdin().is_terminal() {
        let mut buf = Zeroizing::new(String::new());
        io::stdin().read_line(&mut buf)?;
        let line = buf.trim();
        if !line.is_empty() {
            return decode(line);
        }
    }

    //  Interactive (TTY)
    if io::stdin().is_terminal() {
        let entered = Zeroizing::new(rpassword::prompt_password("Key (hex): ")?);
        if !entered.is_empty() {
            return decode(entered.trim());
        }
    }

    bail!("no key material provided")
}

fn decode(hex_key: &str) -> Result<Zeroizing<Vec<u8>>> {
    let bytes = hex::decode(hex_key).context("key material must be hex")?;
    if bytes.is_empty() {
        bail!("key material cannot be empty");
    }
    Ok(Zeroizing::new(bytes))
}
