use crate::core::error::PipelineError;
use crate::core::script::Scene;
use std::path::{Path, PathBuf};

/// The closed roster of story characters.
///
/// Declaration order is the canonical ordering everywhere characters are
/// listed or deduplicated, so cast listings come out stable across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharacterId {
    Lucas,
    Sofia,
    Carlos,
    Juan,
    Martina,
}

impl CharacterId {
    pub const ALL: [CharacterId; 5] = [
        CharacterId::Lucas,
        CharacterId::Sofia,
        CharacterId::Carlos,
        CharacterId::Juan,
        CharacterId::Martina,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CharacterId::Lucas => "lucas",
            CharacterId::Sofia => "sofia",
            CharacterId::Carlos => "carlos",
            CharacterId::Juan => "juan",
            CharacterId::Martina => "martina",
        }
    }
}

/// Canonical profile of one character. The physical descriptions are fixed
/// text that travels verbatim into every image prompt so the characters look
/// the same in every scene.
#[derive(Debug, Clone)]
pub struct CharacterRef {
    pub id: CharacterId,
    pub display_name: &'static str,
    pub age_descriptor: &'static str,
    pub short_description: &'static str,
    pub detailed_physical_description: &'static str,
    pub personality: &'static str,
    pub reference_image_path: PathBuf,
}

/// Fixed character registry. Built once at startup; stages borrow it.
pub struct CharacterRegistry {
    entries: Vec<CharacterRef>,
}

impl CharacterRegistry {
    /// Builds the registry with reference images rooted under `assets_dir`.
    pub fn builtin(assets_dir: &Path) -> Self {
        let characters = assets_dir.join("characters");
        let entries = vec![
            CharacterRef {
                id: CharacterId::Lucas,
                display_name: "Lucas",
                age_descriptor: "7 años",
                short_description: "niño de 7 años, cabello castaño corto, camisa azul celeste, sonrisa brillante con dientes blancos, ojos grandes color café",
                detailed_physical_description: "Niño de 7 años. Cabello: castaño corto, liso. Ojos: grandes y expresivos, color café. Ropa: camisa azul celeste. Piel: tez clara. Expresión: sonrisa brillante con dientes blancos. Rasgos: cara redondeada, mejillas sonrosadas.",
                personality: "alegre, responsable, buen ejemplo",
                reference_image_path: characters.join("lucas_referencia.png"),
            },
            CharacterRef {
                id: CharacterId::Sofia,
                display_name: "Sofia",
                age_descriptor: "7 años",
                short_description: "niña de 7 años, cabello rizado castaño oscuro hasta los hombros, vestido rosa, ojos grandes café oscuro, tez morena clara, expresión curiosa",
                detailed_physical_description: "Niña de 7 años. Cabello: rizado castaño oscuro, largo hasta los hombros. Ojos: grandes, color café oscuro. Ropa: vestido rosa. Piel: tez morena clara. Expresión: curiosa, entusiasta. Rasgos: cara ovalada, rizos definidos y voluminosos.",
                personality: "curiosa, entusiasta por aprender",
                reference_image_path: characters.join("sofia_referencia.png"),
            },
            CharacterRef {
                id: CharacterId::Carlos,
                display_name: "Carlos",
                age_descriptor: "40 años",
                short_description: "hombre adulto de 40 años, cabello negro corto, camisa blanca, ojos café oscuro, tez morena, expresión confiable y amable",
                detailed_physical_description: "Hombre adulto de 40 años. Cabello: negro corto, bien peinado. Ojos: color café oscuro, seguros. Ropa: camisa blanca o polo, pantalón oscuro. Piel: tez morena. Expresión: confiable, seria pero amable. Rasgos: cara cuadrada, mandíbula definida, aspecto deportivo.",
                personality: "responsable, trabajador, paternal",
                reference_image_path: characters.join("carlos_referencia.png"),
            },
            CharacterRef {
                id: CharacterId::Juan,
                display_name: "Juan",
                age_descriptor: "70 años",
                short_description: "adulto mayor de 70 años, cabello blanco corto, suéter marrón, ojos café claro sabios, arrugas de expresión, aspecto de abuelo bondadoso",
                detailed_physical_description: "Adulto mayor de 70 años. Cabello: blanco, corto o con calvicie parcial. Ojos: color café claro, sabios y cálidos. Ropa: suéter marrón o camisa a cuadros. Piel: tez clara con arrugas de expresión. Expresión: sonrisa sabia, mirada bondadosa. Rasgos: aspecto de abuelo cariñoso, ligeramente encorvado.",
                personality: "sabio, paciente, cariñoso, contador de historias",
                reference_image_path: characters.join("juan_referencia.png"),
            },
            CharacterRef {
                id: CharacterId::Martina,
                display_name: "Martina",
                age_descriptor: "45 años",
                short_description: "doctora de 45 años, cabello castaño recogido, bata blanca, gafas rectangulares, estetoscopio, expresión profesional y amable",
                detailed_physical_description: "Mujer adulta de 45 años. Cabello: castaño con mechas grises, recogido en moño profesional. Ojos: color café, inteligentes y amables. Ropa: bata blanca de doctora, estetoscopio al cuello. Accesorios: gafas rectangulares modernas. Piel: tez clara. Expresión: profesional, sonrisa tranquilizadora. Rasgos: cara ovalada, aspecto competente y amigable.",
                personality: "inteligente, empática, profesional, tranquilizadora",
                reference_image_path: characters.join("martina_referencia.png"),
            },
        ];
        Self { entries }
    }

    pub fn get(&self, id: CharacterId) -> &CharacterRef {
        self.entries
            .iter()
            .find(|c| c.id == id)
            .expect("registry covers every CharacterId")
    }

    pub fn all(&self) -> &[CharacterRef] {
        &self.entries
    }

    /// Resolves a speaker name as written by the narrative model to a
    /// registry identity. Accent marks, casing, honorifics and the known
    /// alias spellings are folded before matching.
    pub fn lookup(&self, name: &str) -> Result<CharacterId, PipelineError> {
        let key = normalize(name);
        let key = match key.as_str() {
            "don_juan" => "juan",
            "doctora" | "dra" | "dra_martina" | "doctora_martina" => "martina",
            other => other,
        };
        match key {
            "lucas" => Ok(CharacterId::Lucas),
            "sofia" => Ok(CharacterId::Sofia),
            "carlos" => Ok(CharacterId::Carlos),
            "juan" => Ok(CharacterId::Juan),
            "martina" => Ok(CharacterId::Martina),
            _ => Err(PipelineError::UnknownCharacter(name.to_string())),
        }
    }

    /// Distinct speakers of a scene list, in roster declaration order.
    pub fn cast_in(&self, scenes: &[Scene]) -> Result<Vec<CharacterId>, PipelineError> {
        let mut present = [false; CharacterId::ALL.len()];
        for scene in scenes {
            let id = self.lookup(&scene.dialogue.character)?;
            present[id as usize] = true;
        }
        Ok(CharacterId::ALL
            .into_iter()
            .filter(|id| present[*id as usize])
            .collect())
    }
}

/// Lowercases, strips the Spanish diacritics the model tends to emit and
/// joins words with underscores, so "Doctora Martína" becomes
/// "doctora_martina".
fn normalize(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| match c {
            'á' | 'Á' => 'a',
            'é' | 'É' => 'e',
            'í' | 'Í' => 'i',
            'ó' | 'Ó' => 'o',
            'ú' | 'ü' | 'Ú' | 'Ü' => 'u',
            'ñ' | 'Ñ' => 'n',
            ' ' | '.' => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect::<String>()
        .split('_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::script::Dialogue;

    fn registry() -> CharacterRegistry {
        CharacterRegistry::builtin(Path::new("assets"))
    }

    #[test]
    fn resolves_canonical_names() {
        let registry = registry();
        assert_eq!(registry.lookup("lucas").unwrap(), CharacterId::Lucas);
        assert_eq!(registry.lookup("Sofia").unwrap(), CharacterId::Sofia);
    }

    #[test]
    fn folds_diacritics_and_casing() {
        let registry = registry();
        assert_eq!(registry.lookup("Sofía").unwrap(), CharacterId::Sofia);
        assert_eq!(registry.lookup("MARTÍNA").unwrap(), CharacterId::Martina);
    }

    #[test]
    fn resolves_aliases() {
        let registry = registry();
        assert_eq!(registry.lookup("Don Juan").unwrap(), CharacterId::Juan);
        assert_eq!(registry.lookup("don_juan").unwrap(), CharacterId::Juan);
        assert_eq!(registry.lookup("Doctora").unwrap(), CharacterId::Martina);
        assert_eq!(registry.lookup("Dra. Martina").unwrap(), CharacterId::Martina);
    }

    #[test]
    fn rejects_unknown_names() {
        let registry = registry();
        assert!(matches!(
            registry.lookup("Pedro"),
            Err(PipelineError::UnknownCharacter(_))
        ));
        assert!(matches!(
            registry.lookup(""),
            Err(PipelineError::UnknownCharacter(_))
        ));
    }

    #[test]
    fn cast_is_deduplicated_in_roster_order() {
        let registry = registry();
        let scene = |speaker: &str| Scene {
            number: 1,
            ambient_sound: String::new(),
            image_description: "x".to_string(),
            dialogue: Dialogue {
                character: speaker.to_string(),
                text: "hola".to_string(),
                emotion: String::new(),
            },
        };
        let scenes = vec![scene("Martina"), scene("Lucas"), scene("martina"), scene("Sofía")];
        let cast = registry.cast_in(&scenes).unwrap();
        assert_eq!(
            cast,
            vec![CharacterId::Lucas, CharacterId::Sofia, CharacterId::Martina]
        );
    }
}
