//! Cross-module scenarios: the turn engine driven through scripted model replies.


mod bundle_tests;
