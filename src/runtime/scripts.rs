//! Page-context JavaScript evaluated by the chromiumoxide driver.

use crate::browser::DriverError;
use crate::types::page::ActionKind;

/// Thrown by input scripts when the locator no longer resolves.
pub(crate) const DETACHED_MARKER: &str = "stagehand:target-detached";

/// Serialises the document into the `DomSnapshot` JSON shape. Evaluates to a
/// string so the whole tree crosses CDP as a single value.
pub(crate) const DOM_SNAPSHOT_SCRIPT: &str = r#"(() => {
    const SKIP = new Set(['script', 'style', 'noscript', 'template', 'meta', 'link', 'head']);
    const XHTML = 'http://www.w3.org/1999/xhtml';

    const step = (node) => {
        const name = node.localName;
        let index = 1;
        for (let sib = node.previousElementSibling; sib; sib = sib.previousElementSibling) {
            if (sib.localName === name) index++;
        }
        return node.namespaceURI === XHTML
            ? `${name}[${index}]`
            : `*[local-name()='${name}'][${index}]`;
    };

    const xpathOf = (el) => {
        const parts = [];
        for (let node = el; node && node.nodeType === Node.ELEMENT_NODE; node = node.parentElement) {
            parts.unshift(step(node));
        }
        return '/' + parts.join('/');
    };

    const walk = (el) => {
        const tag = el.localName;
        const style = window.getComputedStyle(el);
        const rect = el.getBoundingClientRect();
        const attributes = {};
        for (const attr of el.attributes) attributes[attr.name] = attr.value;
        if (tag === 'a' && el.href) attributes.href = el.href;
        if ((tag === 'input' || tag === 'textarea' || tag === 'select') && el.value) {
            attributes.value = String(el.value);
        }
        if (tag === 'input' && (el.type === 'checkbox' || el.type === 'radio')) {
            if (el.checked) attributes.checked = ''; else delete attributes.checked;
        }

        let text = '';
        for (const child of el.childNodes) {
            if (child.nodeType === Node.TEXT_NODE) text += child.textContent + ' ';
        }
        text = text.replace(/\s+/g, ' ').trim();

        const shown = style.display !== 'none'
            && style.visibility !== 'hidden'
            && style.visibility !== 'collapse'
            && parseFloat(style.opacity || '1') > 0;
        const sized = (rect.width > 0 && rect.height > 0)
            || style.display === 'contents'
            || el.children.length > 0;

        const children = [];
        if (tag !== 'svg' && tag !== 'iframe') {
            for (const child of el.children) {
                if (!SKIP.has(child.localName)) children.push(walk(child));
            }
        }

        const name = el.getAttribute('aria-label')
            || el.getAttribute('alt')
            || el.getAttribute('placeholder')
            || el.getAttribute('title');

        return {
            tag,
            role: el.getAttribute('role'),
            name: name ? name.trim() : null,
            text: text || null,
            attributes,
            boundingBox: { x: rect.x, y: rect.y, width: rect.width, height: rect.height },
            visible: shown && sized,
            locator: 'xpath=' + xpathOf(el),
            children,
        };
    };

    if (document.readyState === 'loading' || !document.body) {
        throw new Error('document is still loading');
    }
    return JSON.stringify({
        url: location.href,
        title: document.title,
        viewport: { width: window.innerWidth, height: window.innerHeight },
        root: walk(document.body),
    });
})()"#;

/// Strip the `xpath=` prefix from a driver locator.
pub(crate) fn ensure_xpath(locator: &str) -> Result<&str, DriverError> {
    let trimmed = locator.trim();
    let xpath = trimmed.strip_prefix("xpath=").unwrap_or(trimmed);
    if xpath.starts_with('/') {
        Ok(xpath)
    } else {
        Err(DriverError::Unsupported(format!(
            "locator `{locator}` is not an xpath"
        )))
    }
}

fn build_xpath_script(xpath: &str, body: &str) -> Result<String, DriverError> {
    let xpath_json = json_literal(xpath)?;
    Ok(format!(
        "(function() {{
            const result = document.evaluate({xpath_json}, document, null, XPathResult.FIRST_ORDERED_NODE_TYPE, null);
            const el = result.singleNodeValue;
            if (!el || !el.isConnected) {{
                throw new Error('{DETACHED_MARKER}');
            }}
            {body}
        }})()"
    ))
}

fn json_literal(value: &str) -> Result<String, DriverError> {
    serde_json::to_string(value).map_err(|err| DriverError::Message(err.to_string()))
}

/// Script performing `operation` on the element at `locator`.
pub(crate) fn input_script(
    locator: &str,
    operation: ActionKind,
    parameters: &[String],
) -> Result<String, DriverError> {
    let xpath = ensure_xpath(locator)?;
    let first = parameters.first().map(String::as_str);
    let body = match operation {
        ActionKind::Click => "el.scrollIntoView({ block: 'center', inline: 'center' });
            el.click();
            return true;"
            .to_string(),
        ActionKind::ScrollIntoView => {
            "el.scrollIntoView({ behavior: 'smooth', block: 'center', inline: 'center' });
            return true;"
                .to_string()
        }
        ActionKind::Hover => "el.scrollIntoView({ block: 'center', inline: 'center' });
            const rect = el.getBoundingClientRect();
            const init = { bubbles: true, cancelable: true, clientX: rect.x + rect.width / 2, clientY: rect.y + rect.height / 2 };
            el.dispatchEvent(new MouseEvent('mouseover', init));
            el.dispatchEvent(new MouseEvent('mouseenter', { ...init, bubbles: false }));
            el.dispatchEvent(new MouseEvent('mousemove', init));
            return true;"
            .to_string(),
        ActionKind::Type => format!(
            "const value = {text};
            el.focus();
            if ('value' in el) {{
                el.value = value;
            }} else if (el.isContentEditable) {{
                el.textContent = value;
            }}
            el.dispatchEvent(new Event('input', {{ bubbles: true }}));
            el.dispatchEvent(new Event('change', {{ bubbles: true }}));
            return true;",
            text = json_literal(first.unwrap_or_default())?
        ),
        ActionKind::Press => format!(
            "const keyValue = {key};
            el.focus();
            const eventInit = {{ key: keyValue, bubbles: true, cancelable: true }};
            el.dispatchEvent(new KeyboardEvent('keydown', eventInit));
            el.dispatchEvent(new KeyboardEvent('keypress', eventInit));
            el.dispatchEvent(new KeyboardEvent('keyup', eventInit));
            if (keyValue === 'Enter' && el.form && typeof el.form.requestSubmit === 'function') {{
                el.form.requestSubmit();
            }}
            return true;",
            key = json_literal(first.unwrap_or("Enter"))?
        ),
        ActionKind::Select => format!(
            "const desired = {value};
            if (el.localName !== 'select') {{
                throw new Error('Target is not a <select> element');
            }}
            const options = Array.from(el.options);
            const match = options.find(opt => opt.value === desired || opt.text.trim() === desired);
            if (!match) {{
                throw new Error('No matching option for value');
            }}
            el.value = match.value;
            el.dispatchEvent(new Event('input', {{ bubbles: true }}));
            el.dispatchEvent(new Event('change', {{ bubbles: true }}));
            return true;",
            value = json_literal(first.unwrap_or_default())?
        ),
    };
    build_xpath_script(xpath, &body)
}

/// Map a script evaluation failure onto the driver error taxonomy.
pub(crate) fn classify_script_error(locator: Option<&str>, message: String) -> DriverError {
    if message.contains(DETACHED_MARKER) {
        return DriverError::TargetDetached(locator.unwrap_or_default().to_string());
    }
    let navigating = [
        "Execution context was destroyed",
        "Cannot find context with specified id",
        "Inspected target navigated or closed",
        "document is still loading",
    ];
    if navigating.iter().any(|needle| message.contains(needle)) {
        DriverError::Navigating
    } else {
        DriverError::Message(message)
    }
}
