use anyhow::{anyhow, bail, ensure, Context, Error};
use bson::{doc, Bson, Document};
use icu_collator::options::{AlternateHandling, CaseLevel, CollatorOptions, MaxVariable, Strength};
use icu_collator::preferences::{CollationCaseFirst, CollationNumericOrdering};
use icu_collator::{Collator, CollatorBorrowed, CollatorPreferences};
use icu_locale_core::Locale;
use std::cmp::Ordering;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::Arc;
use tracing::debug;

/// Locales the server ships collation data for.
const SUPPORTED_LOCALES: &[&str] = &[
    "af", "am", "ar", "as", "az", "be", "bg", "bn", "bo", "bs", "bs_Cyrl", "ca", "chr", "cs", "cy", "da", "de",
    "de_AT", "dsb", "dz", "ee", "el", "en", "en_US", "en_US_POSIX", "eo", "es", "et", "fa", "fa_AF", "fi", "fil",
    "fo", "fr", "fr_CA", "ga", "gl", "gu", "ha", "haw", "he", "hi", "hr", "hsb", "hu", "hy", "id", "ig", "is", "it",
    "ja", "ka", "kk", "kl", "km", "kn", "ko", "kok", "ky", "lb", "lkt", "ln", "lo", "lt", "lv", "mk", "ml", "mn",
    "mr", "ms", "mt", "my", "nb", "ne", "nl", "nn", "om", "or", "pa", "pl", "ps", "pt", "ro", "ru", "se", "si", "sk",
    "sl", "smn", "sq", "sr", "sr_Latn", "sv", "sw", "ta", "te", "th", "tk", "to", "tr", "ug", "uk", "ur", "uz", "vi",
    "wae", "yi", "yo", "zh", "zh_Hant", "zu",
];

/// String comparison strategy. `Simple` compares bytes.
#[derive(Clone)]
pub enum Collation {
    Simple,
    Locale(Arc<LocaleCollation>),
}

pub struct LocaleCollation {
    spec: CollationSpec,
    collator: CollatorBorrowed<'static>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CaseFirst {
    Lower,
    Off,
    Upper,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Alternate {
    NonIgnorable,
    Shifted,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MaxVariableOption {
    Punct,
    Space,
}

/// A locale collation with every option filled in.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CollationSpec {
    pub locale: String,
    pub strength: u8,
    pub case_level: bool,
    pub case_first: CaseFirst,
    pub numeric_ordering: bool,
    pub alternate: Alternate,
    pub max_variable: MaxVariableOption,
    pub normalization: bool,
    pub backwards: bool,
}

impl Collation {
    pub fn parse(document: &Document) -> Result<Self, Error> {
        let locale = match document.get("locale") {
            Some(Bson::String(locale)) => locale,
            Some(locale) => bail!("Field 'locale' must be a string, found {locale}"),
            None => bail!("Missing expected field \"locale\" in collation {document}"),
        };

        if locale == "simple" {
            ensure!(
                document.keys().all(|key| key == "locale" || key == "version"),
                "If 'locale' is set to 'simple', no other fields may be specified"
            );
            return Ok(Self::Simple);
        }

        let mut spec = CollationSpec {
            locale: locale.clone(),
            strength: 3,
            case_level: false,
            case_first: CaseFirst::Off,
            numeric_ordering: false,
            alternate: Alternate::NonIgnorable,
            max_variable: MaxVariableOption::Punct,
            normalization: false,
            backwards: false,
        };

        for (key, value) in document {
            match (key.as_str(), value) {
                ("locale" | "version", _) => {}
                ("strength", value) => {
                    spec.strength = as_integer(value)
                        .and_then(|strength| u8::try_from(strength).ok())
                        .filter(|strength| (1..=5).contains(strength))
                        .ok_or_else(|| anyhow!("Field 'strength' must be an integer 1 through 5, found {value}"))?;
                }
                ("caseLevel", Bson::Boolean(flag)) => spec.case_level = *flag,
                ("numericOrdering", Bson::Boolean(flag)) => spec.numeric_ordering = *flag,
                ("normalization", Bson::Boolean(flag)) => spec.normalization = *flag,
                ("backwards", Bson::Boolean(flag)) => {
                    ensure!(!*flag, "Field 'backwards' is not supported when set to true");
                }
                ("caseFirst", Bson::String(option)) => {
                    spec.case_first = match option.as_str() {
                        "lower" => CaseFirst::Lower,
                        "off" => CaseFirst::Off,
                        "upper" => CaseFirst::Upper,
                        option => bail!("Field 'caseFirst' must be one of 'upper', 'lower' or 'off', found {option}"),
                    };
                }
                ("alternate", Bson::String(option)) => {
                    spec.alternate = match option.as_str() {
                        "non-ignorable" => Alternate::NonIgnorable,
                        "shifted" => Alternate::Shifted,
                        option => bail!("Field 'alternate' must be 'non-ignorable' or 'shifted', found {option}"),
                    };
                }
                ("maxVariable", Bson::String(option)) => {
                    spec.max_variable = match option.as_str() {
                        "punct" => MaxVariableOption::Punct,
                        "space" => MaxVariableOption::Space,
                        option => bail!("Field 'maxVariable' must be 'punct' or 'space', found {option}"),
                    };
                }
                (
                    key @ ("caseLevel" | "numericOrdering" | "normalization" | "backwards" | "caseFirst" | "alternate" | "maxVariable"),
                    value,
                ) => bail!("Field '{key}' has an invalid type: {value}"),
                (key, _) => bail!("unknown collation spec field: {key}"),
            }
        }

        let collator = build_collator(&spec)
            .with_context(|| format!("collation {document} is not supported"))?;
        Ok(Self::Locale(Arc::new(LocaleCollation { spec, collator })))
    }

    pub fn compare(&self, lhs: &str, rhs: &str) -> Ordering {
        match self {
            Self::Simple => lhs.cmp(rhs),
            Self::Locale(locale) => locale.collator.compare(lhs, rhs),
        }
    }

    pub fn spec(&self) -> Option<&CollationSpec> {
        match self {
            Self::Simple => None,
            Self::Locale(locale) => Some(&locale.spec),
        }
    }

    pub fn to_document(&self) -> Document {
        let Some(spec) = self.spec() else {
            return doc! { "locale": "simple" };
        };

        doc! {
            "locale": spec.locale.clone(),
            "caseLevel": spec.case_level,
            "caseFirst": match spec.case_first {
                CaseFirst::Lower => "lower",
                CaseFirst::Off => "off",
                CaseFirst::Upper => "upper",
            },
            "strength": i32::from(spec.strength),
            "numericOrdering": spec.numeric_ordering,
            "alternate": match spec.alternate {
                Alternate::NonIgnorable => "non-ignorable",
                Alternate::Shifted => "shifted",
            },
            "maxVariable": match spec.max_variable {
                MaxVariableOption::Punct => "punct",
                MaxVariableOption::Space => "space",
            },
            "normalization": spec.normalization,
            "backwards": spec.backwards,
        }
    }
}

impl PartialEq for Collation {
    fn eq(&self, other: &Self) -> bool {
        self.spec() == other.spec()
    }
}

impl Debug for Collation {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> FmtResult {
        match self.spec() {
            None => formatter.write_str("Simple"),
            Some(spec) => spec.fmt(formatter),
        }
    }
}

fn build_collator(spec: &CollationSpec) -> Result<CollatorBorrowed<'static>, Error> {
    let locale = spec
        .locale
        .replace('_', "-")
        .parse::<Locale>()
        .map_err(|error| anyhow!("Field 'locale' is invalid: {error}"))?;
    ensure!(
        SUPPORTED_LOCALES.contains(&spec.locale.as_str()),
        "Field 'locale' is invalid: unsupported locale {}",
        spec.locale
    );

    let mut preferences = CollatorPreferences::from(&locale);
    preferences.case_first = match spec.case_first {
        CaseFirst::Lower => Some(CollationCaseFirst::Lower),
        CaseFirst::Off => None,
        CaseFirst::Upper => Some(CollationCaseFirst::Upper),
    };
    if spec.numeric_ordering {
        preferences.numeric_ordering = Some(CollationNumericOrdering::True);
    }

    let mut options = CollatorOptions::default();
    options.strength = Some(match spec.strength {
        1 => Strength::Primary,
        2 => Strength::Secondary,
        3 => Strength::Tertiary,
        4 => Strength::Quaternary,
        _ => Strength::Identical,
    });
    if spec.case_level {
        options.case_level = Some(CaseLevel::On);
    }
    if spec.alternate == Alternate::Shifted {
        options.alternate_handling = Some(AlternateHandling::Shifted);
        options.max_variable = Some(match spec.max_variable {
            MaxVariableOption::Punct => MaxVariable::Punctuation,
            MaxVariableOption::Space => MaxVariable::Space,
        });
    }

    Collator::try_new(preferences, options).map_err(|error| anyhow!("{error}"))
}

fn as_integer(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(value) => Some(i64::from(*value)),
        Bson::Int64(value) => Some(*value),
        #[allow(clippy::cast_possible_truncation)]
        Bson::Double(value) if value.fract() == 0.0 => Some(*value as i64),
        _ => None,
    }
}

/// Picks the collation in effect: stage > command > collection default >
/// simple. `None` means "not specified", which is not the same as an explicit
/// simple collation.
pub fn resolve(
    collection_default: Option<&Collation>,
    command: Option<&Collation>,
    stage: Option<&Collation>,
) -> Collation {
    let (origin, collation) = match (stage, command, collection_default) {
        (Some(collation), _, _) => ("stage", collation.clone()),
        (None, Some(collation), _) => ("command", collation.clone()),
        (None, None, Some(collation)) => ("collection", collation.clone()),
        (None, None, None) => ("default", Collation::Simple),
    };

    debug!(origin, ?collation, "resolved collation");
    collation
}

#[cfg(test)]
mod tests {
    use super::{resolve, Collation};
    use bson::doc;
    use std::cmp::Ordering;

    fn case_insensitive() -> Collation {
        Collation::parse(&doc! { "locale": "en_US", "strength": 1 }).unwrap()
    }

    fn simple() -> Collation {
        Collation::parse(&doc! { "locale": "simple" }).unwrap()
    }

    macro_rules! invalid {
        ($name:ident, { $($spec:tt)* }) => {
            #[test]
            fn $name() {
                let spec = doc! { $($spec)* };
                assert!(Collation::parse(&spec).is_err(), "{spec:?} should be rejected");
            }
        };
    }

    invalid!(invalid_missing_locale, {"strength": 1});
    invalid!(invalid_locale_type, {"locale": 1});
    invalid!(invalid_simple_with_options, {"locale": "simple", "strength": 1});
    invalid!(invalid_strength_zero, {"locale": "en_US", "strength": 0});
    invalid!(invalid_strength_six, {"locale": "en_US", "strength": 6});
    invalid!(invalid_strength_fraction, {"locale": "en_US", "strength": 1.5});
    invalid!(invalid_case_first, {"locale": "en_US", "caseFirst": "middle"});
    invalid!(invalid_case_level_type, {"locale": "en_US", "caseLevel": "yes"});
    invalid!(invalid_unknown_field, {"locale": "en_US", "color": "red"});
    invalid!(invalid_locale_syntax, {"locale": "!!"});
    invalid!(invalid_locale_unsupported, {"locale": "zz"});
    invalid!(invalid_locale_hyphen, {"locale": "en-US"});
    invalid!(invalid_backwards, {"locale": "fr", "backwards": true});

    #[test]
    fn simple_is_a_value() {
        assert_eq!(simple(), Collation::Simple);
        assert!(simple().spec().is_none());
        assert_eq!(simple().to_document(), doc! { "locale": "simple" });
    }

    #[test]
    fn server_reported_spec_is_accepted() {
        let spec = doc! {
            "locale": "en_US",
            "caseLevel": false,
            "caseFirst": "off",
            "strength": 1,
            "numericOrdering": false,
            "alternate": "non-ignorable",
            "maxVariable": "punct",
            "normalization": false,
            "backwards": false,
            "version": "57.1",
        };

        assert_eq!(Collation::parse(&spec).unwrap(), case_insensitive());
    }

    #[test]
    fn equality_uses_normalized_spec() {
        let explicit = Collation::parse(&doc! { "locale": "en_US", "strength": 3 }).unwrap();
        let implicit = Collation::parse(&doc! { "locale": "en_US" }).unwrap();

        assert_eq!(explicit, implicit);
        assert_ne!(explicit, case_insensitive());
        assert_ne!(case_insensitive(), Collation::Simple);
        assert_eq!(
            Collation::parse(&case_insensitive().to_document()).unwrap(),
            case_insensitive()
        );
    }

    #[test]
    fn strength_one_ignores_case_and_accents() {
        let collation = case_insensitive();
        assert_eq!(collation.compare("b", "B"), Ordering::Equal);
        assert_eq!(collation.compare("cote", "côté"), Ordering::Equal);
        assert_eq!(collation.compare("a", "B"), Ordering::Less);
        assert_eq!(collation.compare("D", "c"), Ordering::Greater);
    }

    #[test]
    fn strength_two_ignores_case_only() {
        let collation = Collation::parse(&doc! { "locale": "en_US", "strength": 2 }).unwrap();
        assert_eq!(collation.compare("b", "B"), Ordering::Equal);
        assert_ne!(collation.compare("cote", "côté"), Ordering::Equal);
    }

    #[test]
    fn strength_three_is_case_sensitive() {
        let collation = Collation::parse(&doc! { "locale": "en_US" }).unwrap();
        assert_ne!(collation.compare("b", "B"), Ordering::Equal);
    }

    #[test]
    fn numeric_ordering() {
        let numeric = Collation::parse(&doc! { "locale": "en_US", "numericOrdering": true }).unwrap();
        assert_eq!(numeric.compare("10", "9"), Ordering::Greater);
        assert_eq!(numeric.compare("a10b", "a2b"), Ordering::Greater);

        let lexical = Collation::parse(&doc! { "locale": "en_US" }).unwrap();
        assert_eq!(lexical.compare("10", "9"), Ordering::Less);
    }

    #[test]
    fn case_first() {
        let upper = Collation::parse(&doc! { "locale": "en_US", "caseFirst": "upper" }).unwrap();
        assert_eq!(upper.compare("A", "a"), Ordering::Less);
        assert_eq!(upper.compare("AB", "ab"), Ordering::Less);

        let lower = Collation::parse(&doc! { "locale": "en_US", "caseFirst": "lower" }).unwrap();
        assert_eq!(lower.compare("a", "A"), Ordering::Less);
        assert_eq!(lower.compare("ab", "AB"), Ordering::Less);

        let primary = Collation::parse(&doc! { "locale": "en_US", "caseFirst": "upper", "strength": 1 }).unwrap();
        assert_eq!(primary.compare("A", "a"), Ordering::Equal);
    }

    #[test]
    fn backwards_false_is_accepted() {
        let collation = Collation::parse(&doc! { "locale": "fr_CA", "backwards": false }).unwrap();
        assert_eq!(collation.spec().map(|spec| spec.backwards), Some(false));
    }

    #[test]
    fn simple_compares_bytes() {
        assert_eq!(Collation::Simple.compare("b", "B"), Ordering::Greater);
        assert_eq!(Collation::Simple.compare("B", "a"), Ordering::Less);
        assert_eq!(Collation::Simple.compare("b", "b"), Ordering::Equal);
    }

    #[test]
    fn precedence() {
        let ci = case_insensitive();
        let simple = simple();

        assert_eq!(resolve(None, None, None), Collation::Simple);
        assert_eq!(resolve(Some(&ci), None, None), ci);
        assert_eq!(resolve(Some(&ci), Some(&simple), None), Collation::Simple);
        assert_eq!(resolve(None, Some(&ci), None), ci);
        assert_eq!(resolve(Some(&simple), Some(&ci), None), ci);
        assert_eq!(resolve(None, None, Some(&ci)), ci);
        assert_eq!(resolve(Some(&simple), Some(&simple), Some(&ci)), ci);
    }

    #[test]
    fn explicit_simple_stage_always_wins() {
        let levels = [None, Some(simple()), Some(case_insensitive())];
        for collection in &levels {
            for command in &levels {
                let resolved = resolve(collection.as_ref(), command.as_ref(), Some(&simple()));
                assert_eq!(resolved, Collation::Simple, "{collection:?} / {command:?}");
            }
        }
    }
}
