//! End-to-end archive-remote sessions over in-memory pipes, with a stand-in
//! git-annex binary resolving content locations.

use annex_bridge::{AnnexIo, AnnexRepo, ArchiveRemote, Engine};
use std::fs::{self, File};
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

#[derive(Clone, Default)]
struct Outbox(Arc<Mutex<Vec<u8>>>);

impl Outbox {
    fn lines(&self) -> Vec<String> {
        String::from_utf8(self.0.lock().unwrap().clone())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl Write for Outbox {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A repository directory holding one annexed tar archive, with a fake
/// git-annex that can resolve the archive's key.
struct Fixture {
    root: TempDir,
}

const ARCHIVE_KEY: &str = "SHA256E-s2048--feedface.tar";
const ARCHIVE_REL: &str = ".git/annex/objects/ab/cd/bundle.tar";

impl Fixture {
    fn new() -> Self {
        let root = TempDir::new().unwrap();
        git2::Repository::init(root.path()).unwrap();

        // Archive with one member
        let payload = root.path().join("member.dat");
        fs::write(&payload, b"member payload").unwrap();
        let archive_path = root.path().join(ARCHIVE_REL);
        fs::create_dir_all(archive_path.parent().unwrap()).unwrap();
        let mut builder = tar::Builder::new(File::create(&archive_path).unwrap());
        builder
            .append_path_with_name(&payload, "data/member.dat")
            .unwrap();
        builder.finish().unwrap();

        // Stand-in git-annex: knows contentlocation for the archive key only
        let script = root.path().join("fake-git-annex");
        fs::write(
            &script,
            format!(
                "#!/bin/sh\nif [ \"$1\" = contentlocation ] && [ \"$2\" = \"{}\" ]; then\n  echo {}\nelse\n  exit 1\nfi\n",
                ARCHIVE_KEY, ARCHIVE_REL
            ),
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        }

        Self { root }
    }

    fn remote(&self) -> ArchiveRemote {
        let script = self.root.path().join("fake-git-annex");
        let repo = AnnexRepo::at(self.root.path()).annex_bin(script.to_string_lossy());
        ArchiveRemote::new(repo, self.root.path().join("extract-cache"))
    }

    fn run(&self, script: &str) -> Vec<String> {
        let outbox = Outbox::default();
        let mut engine = Engine::new(
            self.remote(),
            AnnexIo::new(
                Box::new(Cursor::new(script.as_bytes().to_vec())),
                Box::new(outbox.clone()),
            ),
        );
        engine.run().unwrap();
        outbox.lines()
    }
}

#[test]
fn claimurl_archive_scheme_only() {
    let fixture = Fixture::new();
    let lines = fixture.run(
        "CLAIMURL dl+archive:KEY/path\nCLAIMURL http://example.com/x\n",
    );
    assert_eq!(lines[1], "CLAIMURL-SUCCESS");
    assert_eq!(lines[2], "CLAIMURL-FAILURE");
}

#[test]
fn checkurl_reports_member_size() {
    let fixture = Fixture::new();
    let url = format!("dl+archive:{}/data/member.dat", ARCHIVE_KEY);
    let lines = fixture.run(&format!("CHECKURL {}\n", url));
    assert_eq!(lines[1], "CHECKURL-CONTENTS 14");
}

#[test]
fn checkurl_prefers_size_from_url_fragment() {
    let fixture = Fixture::new();
    let url = format!("dl+archive:{}/data/member.dat#size=14", ARCHIVE_KEY);
    let lines = fixture.run(&format!("CHECKURL {}\n", url));
    assert_eq!(lines[1], "CHECKURL-CONTENTS 14");
}

#[test]
fn checkurl_fails_for_unresolvable_archive() {
    let fixture = Fixture::new();
    let lines = fixture.run("CHECKURL dl+archive:NOSUCHKEY/data/member.dat\n");
    assert_eq!(lines[1], "CHECKURL-FAILURE");
}

#[test]
fn checkpresent_success_when_archive_is_local() {
    let fixture = Fixture::new();
    let script = format!(
        "CHECKPRESENT FILEKEY\nVALUE dl+archive:{}/data/member.dat\nVALUE\n",
        ARCHIVE_KEY
    );
    let lines = fixture.run(&script);
    assert!(lines.contains(&"GETURLS FILEKEY dl+archive:".to_string()));
    assert!(lines.contains(&"CHECKPRESENT-SUCCESS FILEKEY".to_string()));
}

#[test]
fn checkpresent_unknown_when_archive_is_not_local() {
    let fixture = Fixture::new();
    let script = "CHECKPRESENT FILEKEY\nVALUE dl+archive:NOSUCHKEY/data/member.dat\nVALUE\n";
    let lines = fixture.run(script);
    // Never a hard FAILURE from a local miss
    assert!(lines
        .iter()
        .any(|l| l.starts_with("CHECKPRESENT-UNKNOWN FILEKEY ")));
}

#[test]
fn retrieve_delivers_member_into_destination() {
    let fixture = Fixture::new();
    let dest = fixture.root.path().join("restored/file.dat");
    let script = format!(
        "TRANSFER RETRIEVE FILEKEY {}\nVALUE dl+archive:{}/data/member.dat#size=14\nVALUE\n",
        dest.display(),
        ARCHIVE_KEY
    );
    let lines = fixture.run(&script);
    assert!(lines.contains(&"TRANSFER-SUCCESS RETRIEVE FILEKEY".to_string()));
    assert_eq!(fs::read(&dest).unwrap(), b"member payload");
}

#[test]
fn retrieve_failure_keeps_the_session_alive() {
    let fixture = Fixture::new();
    let dest = fixture.root.path().join("restored/file.dat");
    let script = format!(
        "TRANSFER RETRIEVE FILEKEY {}\nVALUE dl+archive:NOSUCHKEY/x\nVALUE\nGETCOST\n",
        dest.display()
    );
    let lines = fixture.run(&script);
    assert!(lines
        .iter()
        .any(|l| l.starts_with("TRANSFER-FAILURE RETRIEVE FILEKEY ")));
    assert!(lines.iter().any(|l| l.starts_with("COST ")));
    assert!(!Path::new(&dest).exists());
}

#[test]
fn remove_always_refuses() {
    let fixture = Fixture::new();
    let lines = fixture.run("REMOVE FILEKEY\n");
    assert!(lines[1].starts_with("REMOVE-FAILURE FILEKEY "));
}

#[test]
fn whereis_names_the_containing_archive() {
    let fixture = Fixture::new();
    let script = format!(
        "WHEREIS FILEKEY\nVALUE dl+archive:{}/data/member.dat\nVALUE\n",
        ARCHIVE_KEY
    );
    let lines = fixture.run(&script);
    assert!(lines.contains(&format!(
        "WHEREIS-SUCCESS in archive {} at data/member.dat",
        ARCHIVE_KEY
    )));
}

#[test]
fn full_session_with_noise_survives() {
    let fixture = Fixture::new();
    let url = format!("dl+archive:{}/data/member.dat", ARCHIVE_KEY);
    // PREPARE asks the host for a cost setting; the host answers VALUE 250
    let script = format!(
        "INITREMOTE\nPREPARE\nVALUE 250\nGETCOST\nBOGUSVERB with args\nCHECKURL {}\n",
        url
    );
    let lines = fixture.run(&script);
    assert_eq!(lines[0], "VERSION 1");
    assert_eq!(lines[1], "INITREMOTE-SUCCESS");
    assert_eq!(lines[2], "GETCONFIG cost");
    assert_eq!(lines[3], "PREPARE-SUCCESS");
    assert_eq!(lines[4], "COST 250");
    assert_eq!(lines[5], "UNSUPPORTED-REQUEST");
    assert_eq!(lines[6], "CHECKURL-CONTENTS 14");
}
