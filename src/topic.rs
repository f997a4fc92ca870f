use crate::config::MAX_TOPIC_LEN;

pub fn validate_name(name: &str) -> Result<(), crate::Error> {
    if name.is_empty() || name.len() > MAX_TOPIC_LEN || name.contains(['+', '#', '\0']) {
        return Err(crate::Error::InvalidTopic);
    }

    Ok(())
}

/// Checks a subscription filter. `+` must fill a whole level, `#` must fill
/// the last level.
pub fn validate_filter(filter: &str) -> Result<(), crate::Error> {
    if filter.is_empty() || filter.len() > MAX_TOPIC_LEN || filter.contains('\0') {
        return Err(crate::Error::InvalidTopic);
    }

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        let valid = match level {
            "+" => true,
            "#" => levels.peek().is_none(),
            _ => !level.contains(['+', '#']),
        };

        if !valid {
            return Err(crate::Error::InvalidTopic);
        }
    }

    Ok(())
}

/// Whether `published` is selected by `filter`.
pub fn matches(published: &str, filter: &str) -> bool {
    if published.starts_with('$') && filter.starts_with(['+', '#']) {
        return false;
    }

    let mut topic_levels = published.split('/');
    let mut filter_levels = filter.split('/').peekable();

    loop {
        let topic_level = topic_levels.next();

        match filter_levels.next() {
            Some("#") if filter_levels.peek().is_none() => return true,
            Some(filter_level) => match topic_level {
                None => return false,
                Some(_) if filter_level == "+" => {}
                Some(level) if level == filter_level => {}
                Some(_) => return false,
            },
            None => return topic_level.is_none(),
        }
    }
}
