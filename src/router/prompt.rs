//! System-instruction assembly for the fast brain.
//!
//! Folds durable fact memory, the current device snapshot, and the
//! recent transcript window into one instruction string. The persona and
//! rule wording live with the deployment, not here.

use crate::history::HistoryEntry;
use crate::router::live::SpeakerRole;

/// Assemble the per-session system instruction.
pub fn assemble(core_facts: &str, device_lines: &str, recent: &[HistoryEntry]) -> String {
    let mut out = String::new();
    out.push_str(
        "Du bist das schnelle Sprach-Interface des Smart Homes. \
         Antworte kurz und in der Sprache des Nutzers.\n",
    );

    out.push_str("\n=== CORE MEMORY ===\n");
    if core_facts.trim().is_empty() {
        out.push_str("(leer)\n");
    } else {
        out.push_str(core_facts.trim());
        out.push('\n');
    }

    out.push_str("\n=== VERFÜGBARE GERÄTE (STATE) ===\n");
    out.push_str(device_lines);

    if !recent.is_empty() {
        out.push_str("\n=== LETZTE UNTERHALTUNG ===\n");
        for entry in recent {
            let speaker = match entry.role {
                SpeakerRole::User => "User",
                SpeakerRole::Assistant => "Assistent",
            };
            out.push_str(&format!("{speaker}: {}\n", entry.text));
        }
    }

    out.push_str(
        "\n=== REGELN ===\n\
         Einfache, sofortige Aktionen führst du selbst über Tools aus. \
         Mehrschrittige oder komplexe Anfragen delegierst du ZWINGEND mit \
         delegate_to_backend und gibst dabei die wörtliche Transkription \
         weiter. Nach erfolgreichem Toolaufruf antworte ultrakurz.\n",
    );

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sections_are_present() {
        let prompt = assemble("Der Nutzer heißt Jan.", "- Lampe [ID: light.l] (on)\n", &[]);
        assert!(prompt.contains("CORE MEMORY"));
        assert!(prompt.contains("Der Nutzer heißt Jan."));
        assert!(prompt.contains("light.l"));
        assert!(!prompt.contains("LETZTE UNTERHALTUNG"));
    }

    #[test]
    fn recent_transcript_is_attributed() {
        let recent = vec![
            HistoryEntry {
                role: SpeakerRole::User,
                text: "Licht an".into(),
            },
            HistoryEntry {
                role: SpeakerRole::Assistant,
                text: "Ok.".into(),
            },
        ];
        let prompt = assemble("", "Keine Geräte gefunden.\n", &recent);
        assert!(prompt.contains("User: Licht an"));
        assert!(prompt.contains("Assistent: Ok."));
    }

    #[test]
    fn empty_facts_render_placeholder() {
        let prompt = assemble("  ", "x\n", &[]);
        assert!(prompt.contains("(leer)"));
    }
}
