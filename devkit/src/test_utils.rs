/*!
Fixtures de firmware pour les tests `program`

Écrit dans un répertoire temporaire des images prêtes à l'emploi:
- Intel HEX avec backdoor bootloader configuré (CCA du CC2538)
- Intel HEX sans backdoor (doit être rejeté)
- Binaires bruts de taille arbitraire
*/

use std::fs;
use std::path::PathBuf;
use anyhow::Result;
use tempfile::TempDir;

/// Application à 0x00200000 + CCA avec backdoor actif (PA6, actif bas)
const BOOTLOADABLE_IHEX: &str = "\
:020000040020DA
:10000000000102030405060708090A0B0C0D0E0F78
:020000040027D3
:0CFFD400FFFFFFF6FFFFFFFF0000200012
:00000001FF
";

/// Même image mais le dernier octet de configuration vaut 0xFF
const NO_BACKDOOR_IHEX: &str = "\
:020000040020DA
:10000000000102030405060708090A0B0C0D0E0F78
:020000040027D3
:0CFFD400FFFFFFFFFFFFFFFF0000200009
:00000001FF
";

/// Répertoire temporaire contenant les images de test
pub struct FirmwareFixtures {
    dir: TempDir,
}

impl FirmwareFixtures {
    /// Crée un nouveau répertoire de fixtures
    pub fn new() -> Result<Self> {
        env_logger::try_init().ok(); // Init logging pour tests

        Ok(Self {
            dir: tempfile::tempdir()?,
        })
    }

    /// Chemin d'un fichier (existant ou non) dans le répertoire
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Image Intel HEX acceptée par le bootloader de l'openmote-b
    pub fn bootloadable_ihex(&self, name: &str) -> Result<PathBuf> {
        self.write(name, BOOTLOADABLE_IHEX.as_bytes())
    }

    /// Image Intel HEX qui écraserait la configuration du backdoor
    pub fn ihex_without_backdoor(&self, name: &str) -> Result<PathBuf> {
        self.write(name, NO_BACKDOOR_IHEX.as_bytes())
    }

    /// Binaire brut rempli de 0xFF
    pub fn bin(&self, name: &str, size: usize) -> Result<PathBuf> {
        self.write(name, &vec![0xFF; size])
    }

    pub fn write(&self, name: &str, content: &[u8]) -> Result<PathBuf> {
        let path = self.path(name);
        fs::write(&path, content)?;
        log::info!("🧪 Wrote fixture {} ({} bytes)", path.display(), content.len());
        Ok(path)
    }
}
