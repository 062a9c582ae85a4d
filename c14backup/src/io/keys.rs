//! Local SSH public key fingerprinting.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use regex::Regex;

use crate::io::process::{CommandRunner, CommandSpec};

pub const FINGERPRINT_TOOL: &str = "ssh-keygen";

static MD5_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"MD5:([a-z0-9:]*)").unwrap());

/// MD5 fingerprint (`aa:bb:...`) of a public key, as the provider lists it.
pub fn public_key_fingerprint<R: CommandRunner + ?Sized>(
    runner: &R,
    public_key: &Path,
) -> Result<String> {
    let spec = CommandSpec::new(FINGERPRINT_TOOL)
        .args(["-E", "md5", "-lf"])
        .arg(public_key.display().to_string());
    let output = runner
        .run(&spec)
        .with_context(|| format!("fingerprint {}", public_key.display()))?;
    if !output.success() {
        bail!(
            "cannot fingerprint {}\n{}",
            public_key.display(),
            output.describe(&spec)
        );
    }
    parse_md5_fingerprint(&output.stdout_text()).with_context(|| {
        format!(
            "no MD5 fingerprint in {} output for {}",
            FINGERPRINT_TOOL,
            public_key.display()
        )
    })
}

pub fn parse_md5_fingerprint(text: &str) -> Option<String> {
    MD5_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|fp| !fp.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedRunner, keygen_output, output};

    #[test]
    fn parses_keygen_line() {
        assert_eq!(
            parse_md5_fingerprint("2048 MD5:3f:1a:9c:00 me@host (RSA)\n").as_deref(),
            Some("3f:1a:9c:00")
        );
        assert_eq!(parse_md5_fingerprint("2048 SHA256:abc me@host (RSA)"), None);
    }

    #[test]
    fn runs_keygen_with_md5() {
        let runner = ScriptedRunner::new();
        runner.push("ssh-keygen", keygen_output("aa:bb"));
        let fp = public_key_fingerprint(&runner, Path::new("/k/id.pub")).expect("fingerprint");
        assert_eq!(fp, "aa:bb");
        assert_eq!(
            runner.calls_to("ssh-keygen")[0].args,
            vec!["-E", "md5", "-lf", "/k/id.pub"]
        );
    }

    #[test]
    fn keygen_failure_is_fatal() {
        let runner = ScriptedRunner::new();
        runner.push("ssh-keygen", output(255, "", "/k/id.pub is not a public key file."));
        let err = public_key_fingerprint(&runner, Path::new("/k/id.pub")).expect_err("fail");
        assert!(format!("{err:#}").contains("not a public key file"));
    }
}
