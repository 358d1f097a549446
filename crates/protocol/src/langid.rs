//! USB LANGID codes and default-language selection

/// Primary language bits of a LANGID
pub const PRIMARY_LANGUAGE_MASK: u16 = 0x03ff;

pub const ENGLISH_US: u16 = 0x0409;

/// LANGID to POSIX locale name
const LOCALES: &[(u16, &str)] = &[
    (0x0401, "ar_SA"),
    (0x0404, "zh_TW"),
    (0x0405, "cs_CZ"),
    (0x0406, "da_DK"),
    (0x0407, "de_DE"),
    (0x0408, "el_GR"),
    (0x0409, "en_US"),
    (0x040b, "fi_FI"),
    (0x040c, "fr_FR"),
    (0x040d, "he_IL"),
    (0x040e, "hu_HU"),
    (0x0410, "it_IT"),
    (0x0411, "ja_JP"),
    (0x0412, "ko_KR"),
    (0x0413, "nl_NL"),
    (0x0414, "nb_NO"),
    (0x0415, "pl_PL"),
    (0x0416, "pt_BR"),
    (0x0419, "ru_RU"),
    (0x041d, "sv_SE"),
    (0x041f, "tr_TR"),
    (0x0804, "zh_CN"),
    (0x0807, "de_CH"),
    (0x0809, "en_GB"),
    (0x080a, "es_MX"),
    (0x080c, "fr_BE"),
    (0x0816, "pt_PT"),
    (0x0c07, "de_AT"),
    (0x0c09, "en_AU"),
    (0x0c0a, "es_ES"),
    (0x0c0c, "fr_CA"),
    (0x1009, "en_CA"),
];

/// Locale name for a LANGID, if known
pub fn locale_name(lang_id: u16) -> Option<&'static str> {
    LOCALES
        .iter()
        .find(|(id, _)| *id == lang_id)
        .map(|(_, name)| *name)
}

/// LANGID for a locale such as `de_DE`, `de_DE.UTF-8` or `de`
///
/// A bare language code resolves to the first table entry for it.
pub fn lang_id(locale: &str) -> Option<u16> {
    let locale = locale
        .split(['.', '@'])
        .next()
        .unwrap_or(locale)
        .replace('-', "_");
    if let Some(&(id, _)) = LOCALES.iter().find(|(_, name)| *name == locale) {
        return Some(id);
    }
    let language = locale.split('_').next().unwrap_or(&locale);
    LOCALES
        .iter()
        .find(|(_, name)| name.split('_').next() == Some(language))
        .map(|(id, _)| *id)
}

pub fn primary_language(lang_id: u16) -> u16 {
    lang_id & PRIMARY_LANGUAGE_MASK
}

/// The process locale from `LC_ALL`, `LC_MESSAGES` or `LANG`
///
/// `C` and `POSIX` count as unset.
pub fn locale_from_env() -> Option<String> {
    ["LC_ALL", "LC_MESSAGES", "LANG"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|value| !value.is_empty() && value != "C" && value != "POSIX")
}

/// Pick the language strings are read in by default
///
/// A device supporting a single language gets that language. Otherwise
/// an exact match on the locale wins, then a match on the primary
/// language, then whatever the device lists first.
pub fn choose_language(supported: &[u16], locale: Option<&str>) -> Option<u16> {
    let first = *supported.first()?;
    if supported.len() == 1 {
        return Some(first);
    }
    let Some(wanted) = locale.and_then(lang_id) else {
        return Some(first);
    };
    supported
        .iter()
        .find(|&&id| id == wanted)
        .or_else(|| {
            supported
                .iter()
                .find(|&&id| primary_language(id) == primary_language(wanted))
        })
        .copied()
        .or(Some(first))
}
