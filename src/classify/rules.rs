//! Built-in classification table.
//!
//! Bump `RULESET_VERSION` whenever a label, detector or weight changes:
//! stored records carry the version they were produced with.

use super::*;
use crate::signals::Flag;

pub const RULESET_VERSION: &str = "1.1.0";

fn svc(name: &'static str, words: &[&'static str]) -> LabelRule {
    label(name, keywords(words))
}

fn with(mut base: Vec<WeightedDetector>, extra: Vec<WeightedDetector>) -> Vec<WeightedDetector> {
    base.extend(extra);
    base
}

impl RuleSet {
    pub fn builtin() -> Self {
        Self {
            version: RULESET_VERSION,
            dimensions: vec![
                aws_services(),
                solution_type(),
                competency(),
                customer_problems(),
                solution_marketing(),
                deployment_tools(),
                deployment_readiness(),
                framework(),
                language_family(),
                cost_range(),
                setup_time(),
                business_value(),
                target_audience(),
                use_case_category(),
                integration_complexity(),
                maintenance_level(),
                scalability(),
                freshness(),
                genai_agentic(),
                industry_vertical(),
            ],
        }
    }
}

fn aws_services() -> Dimension {
    Dimension::multi(
        "aws_services",
        vec![
            // Compute
            label("Lambda", with(keywords(&["lambda", "aws lambda"]), vec![topic("aws-lambda")])),
            label(
                "Serverless",
                vec![topic("serverless").weight(0.3), description("serverless").weight(0.3)],
            ),
            svc("EC2", &["ec2"]),
            svc("ECS", &["ecs"]),
            svc("EKS", &["eks"]),
            svc("Fargate", &["fargate"]),
            svc("Batch", &["aws batch"]),
            svc("Lightsail", &["lightsail"]),
            // Storage
            label(
                "S3",
                with(keywords(&["s3", "amazon s3"]), vec![topic("aws-s3"), topic("amazon-s3")]),
            ),
            svc("EBS", &["ebs"]),
            svc("EFS", &["efs"]),
            svc("FSx", &["fsx"]),
            // Database
            svc("RDS", &["rds"]),
            label("DynamoDB", with(keywords(&["dynamodb"]), vec![topic("aws-dynamodb")])),
            svc("Aurora", &["aurora"]),
            svc("Redshift", &["redshift"]),
            svc("DocumentDB", &["documentdb"]),
            svc("Neptune", &["neptune"]),
            svc("Timestream", &["timestream"]),
            // Networking
            svc("VPC", &["vpc"]),
            svc("CloudFront", &["cloudfront"]),
            svc("Route53", &["route53", "route 53"]),
            svc("ELB", &["elb", "alb", "nlb", "load balancer"]),
            svc("API Gateway", &["api gateway", "apigateway"]),
            // Security
            svc("IAM", &["iam"]),
            svc("Cognito", &["cognito"]),
            svc("KMS", &["kms"]),
            svc("Secrets Manager", &["secrets manager"]),
            svc("ACM", &["certificate manager"]),
            svc("WAF", &["waf"]),
            // Analytics
            svc("Kinesis", &["kinesis"]),
            svc("Athena", &["athena"]),
            svc("Glue", &["glue"]),
            svc("EMR", &["emr"]),
            svc("QuickSight", &["quicksight"]),
            svc("OpenSearch", &["opensearch", "elasticsearch"]),
            // AI/ML
            svc("SageMaker", &["sagemaker"]),
            svc("Bedrock", &["bedrock"]),
            svc("Comprehend", &["comprehend"]),
            svc("Rekognition", &["rekognition"]),
            svc("Textract", &["textract"]),
            svc("Polly", &["polly"]),
            // DevOps
            svc("CloudFormation", &["cloudformation"]),
            label("CDK", with(keywords(&["cdk", "aws cdk"]), vec![topic("aws-cdk")])),
            svc("CodeBuild", &["codebuild"]),
            svc("CodeDeploy", &["codedeploy"]),
            svc("CodePipeline", &["codepipeline"]),
            svc("CodeCommit", &["codecommit"]),
            // Monitoring
            svc("CloudWatch", &["cloudwatch"]),
            svc("X-Ray", &["x ray", "xray"]),
            svc("CloudTrail", &["cloudtrail"]),
            // Messaging
            svc("SNS", &["sns"]),
            svc("SQS", &["sqs"]),
            svc("EventBridge", &["eventbridge"]),
            svc("Step Functions", &["step functions", "stepfunctions"]),
        ],
    )
    .with_max_secondary(4)
}

fn solution_type() -> Dimension {
    Dimension::single(
        "solution_type",
        vec![
            label(
                "Innovation Catalysts",
                with(
                    keywords(&["ai", "ml", "machine learning", "neural", "deep learning", "llm", "genai", "bedrock"]),
                    vec![flag(Flag::MentionsGenAi)],
                ),
            ),
            svc(
                "Compliance Accelerators",
                &["security", "compliance", "governance", "audit", "policy"],
            ),
            svc("Quick Wins", &["tool", "utility", "helper", "simple", "quick", "cli"]),
            label(
                "Foundation Builders",
                with(
                    keywords(&["infrastructure", "foundation", "platform", "landing zone"]),
                    vec![
                        flag(Flag::HasTerraform).weight(0.2),
                        flag(Flag::HasCloudFormation).weight(0.2),
                        flag(Flag::HasCdk).weight(0.2),
                    ],
                ),
            ),
        ],
    )
}

fn competency() -> Dimension {
    Dimension::single(
        "competency",
        vec![
            svc("Analytics", &["analytics", "data", "etl", "warehouse", "data lake"]),
            svc("Security", &["security", "iam", "encryption"]),
            label(
                "DevOps",
                with(
                    keywords(&["devops", "cicd", "ci cd", "pipeline", "deploy", "deployment"]),
                    vec![flag(Flag::HasCi).weight(0.15)],
                ),
            ),
            label(
                "AI/ML",
                with(
                    keywords(&["ai", "ml", "machine learning", "sagemaker"]),
                    vec![flag(Flag::MentionsGenAi)],
                ),
            ),
        ],
    )
}

fn customer_problems() -> Dimension {
    Dimension::single(
        "customer_problems",
        vec![
            svc("Complex Implementation", &["complex", "difficult", "challenge", "legacy"]),
            svc("Time to Market", &["quick", "fast", "quickstart", "rapid", "accelerate"]),
            svc("Cost Pressure", &["cost", "savings", "finops", "billing"]),
            svc("Security Risk", &["vulnerability", "threat", "secure", "guardrails"]),
            svc("Operational Overhead", &["automate", "automation", "toil", "manual"]),
            svc("Development Efficiency", &["developer", "productivity", "sdk", "framework", "library"]),
        ],
    )
}

fn solution_marketing() -> Dimension {
    Dimension::single(
        "solution_marketing",
        vec![
            label(
                "setup",
                with(
                    keywords(&["setup", "bootstrap", "install", "getting started", "quickstart"]),
                    vec![name("setup"), name("bootstrap")],
                ),
            ),
            label(
                "landingzone",
                with(
                    keywords(&["landing zone", "account setup", "multi account", "organization"]),
                    vec![name("landing zone")],
                ),
            ),
            label(
                "starter",
                with(
                    keywords(&["starter", "template", "boilerplate", "scaffold"]),
                    vec![name("starter"), name("template")],
                ),
            ),
            svc("optimise", &["optimize", "optimise", "optimization", "performance", "cost", "efficiency"]),
            svc("compliance", &["compliance", "security", "governance", "audit"]),
            svc("improvement", &["improve", "enhance", "upgrade", "migrate", "migration"]),
            svc("visibility", &["monitor", "monitoring", "observability", "dashboard", "metrics", "logging"]),
            svc("foundation", &["foundation", "infrastructure", "core", "base"]),
        ],
    )
}

fn deployment_tools() -> Dimension {
    Dimension::multi(
        "deployment_tools",
        vec![
            label(
                "CDK",
                vec![
                    flag(Flag::HasCdk).weight(0.5),
                    name("cdk"),
                    topic("aws-cdk"),
                    topic("cdk"),
                ],
            ),
            label(
                "Terraform",
                vec![flag(Flag::HasTerraform).weight(0.5), name("terraform"), topic("terraform")],
            ),
            label(
                "CloudFormation",
                vec![
                    flag(Flag::HasCloudFormation).weight(0.5),
                    name("cloudformation"),
                    name("cfn"),
                    topic("cloudformation"),
                ],
            ),
            label("SAM", vec![flag(Flag::HasSam).weight(0.5), name("sam"), topic("aws-sam")]),
            label(
                "Serverless Framework",
                vec![flag(Flag::HasServerlessFramework).weight(0.5), topic("serverless-framework")],
            ),
            label("Docker", vec![flag(Flag::HasDockerfile).weight(0.5), topic("docker")]),
            label(
                "Kubernetes",
                vec![flag(Flag::HasKubernetes).weight(0.5), topic("kubernetes"), topic("helm")],
            ),
        ],
    )
}

fn deployment_readiness() -> Dimension {
    Dimension::single(
        "deployment_readiness",
        vec![
            label(
                "Production Ready",
                vec![
                    stars(1001, None).weight(0.6),
                    flag(Flag::HasCi).weight(0.2),
                    flag(Flag::HasTests).weight(0.2),
                    age_at_least(365),
                ],
            ),
            label(
                "Beta Ready",
                vec![stars(101, Some(1001)).weight(0.6), flag(Flag::HasTests).weight(0.1)],
            ),
            label("Development", vec![stars(0, Some(101)).weight(0.6)]),
        ],
    )
}

fn framework() -> Dimension {
    Dimension::single(
        "framework",
        vec![
            label(
                "Python/Flask/Django",
                with(
                    vec![language("python"), file("requirements.txt").weight(0.2), file("pyproject.toml").weight(0.2)],
                    keywords(&["flask", "django", "fastapi"]),
                ),
            ),
            label(
                "Node.js/React",
                with(
                    vec![language("javascript"), language("typescript"), file("package.json").weight(0.2)],
                    keywords(&["react", "node js", "nodejs", "express", "next js"]),
                ),
            ),
            label(
                "Spring/Maven",
                with(
                    vec![language("java"), language("kotlin"), file("pom.xml").weight(0.2), file("build.gradle").weight(0.2)],
                    keywords(&["spring", "spring boot"]),
                ),
            ),
            label(
                ".NET",
                vec![language("c#"), language("f#"), file("*.csproj"), file("*.sln")],
            ),
            label("Go", vec![language("go"), file("go.mod")]),
            label("Rust", vec![language("rust"), file("cargo.toml")]),
        ],
    )
}

fn language_family() -> Dimension {
    Dimension::single(
        "language_family",
        vec![
            label("Python", vec![language("python"), language("jupyter notebook")]),
            label("JavaScript/TypeScript", vec![language("javascript"), language("typescript")]),
            label(
                "JVM",
                vec![language("java"), language("kotlin"), language("scala"), language("groovy")],
            ),
            label(
                "Systems",
                vec![language("go"), language("rust"), language("c"), language("c++")],
            ),
            label(".NET", vec![language("c#"), language("f#")]),
            label(
                "Infrastructure as Code",
                vec![language("hcl"), flag(Flag::HasTerraform).weight(0.2), flag(Flag::HasCloudFormation).weight(0.2)],
            ),
            label("Shell", vec![language("shell"), language("powershell")]),
            label("Web", vec![language("html"), language("css"), language("vue")]),
        ],
    )
}

fn cost_range() -> Dimension {
    Dimension::single(
        "cost_range",
        vec![
            label("High ($10K+)", vec![stars(5001, None).weight(0.6)]),
            label("Medium ($1K-10K)", vec![stars(1001, Some(5001)).weight(0.6)]),
            label("Low (<$1K)", vec![stars(0, Some(1001)).weight(0.6)]),
        ],
    )
}

fn setup_time() -> Dimension {
    Dimension::single(
        "setup_time",
        vec![
            label(
                "Full-day Setup (4-8 hours)",
                with(
                    vec![stars(5001, None).weight(0.4), flag(Flag::HasKubernetes).weight(0.3)],
                    keywords(&["multi account", "enterprise"]),
                ),
            ),
            label(
                "Half-day Setup (1-4 hours)",
                vec![
                    stars(1001, Some(5001)).weight(0.4),
                    flag(Flag::HasTerraform).weight(0.15),
                    flag(Flag::HasCdk).weight(0.15),
                ],
            ),
            label(
                "Quick Setup (< 1 hour)",
                with(
                    vec![stars(0, Some(1001)).weight(0.4)],
                    keywords(&["quickstart", "one click", "getting started"]),
                ),
            ),
        ],
    )
}

fn business_value() -> Dimension {
    Dimension::single(
        "business_value",
        vec![
            label(
                "High",
                with(
                    vec![stars(1001, None).weight(0.4)],
                    keywords(&["enterprise", "production", "reduce cost", "cost savings"]),
                ),
            ),
            label(
                "Medium",
                vec![stars(101, Some(1001)).weight(0.4), flag(Flag::HasDocs).weight(0.2)],
            ),
            svc("Exploratory", &["sample", "demo", "example", "workshop", "experimental", "poc"]),
        ],
    )
}

fn target_audience() -> Dimension {
    Dimension::single(
        "target_audience",
        vec![
            label(
                "Developers",
                with(
                    keywords(&["sdk", "library", "api", "developer", "developers", "cli"]),
                    vec![flag(Flag::HasPackageManifest).weight(0.2)],
                ),
            ),
            svc("DevOps Engineers", &["devops", "ci cd", "pipeline", "deployment", "infrastructure"]),
            svc("Security Teams", &["security", "compliance", "audit", "threat"]),
            label(
                "Data Scientists",
                with(
                    keywords(&["data science", "machine learning", "notebook", "sagemaker"]),
                    vec![language("jupyter notebook")],
                ),
            ),
            svc("Architects", &["reference architecture", "architecture", "pattern", "patterns", "best practices"]),
            svc("Learners", &["workshop", "tutorial", "learn", "training", "lab", "labs"]),
        ],
    )
}

fn use_case_category() -> Dimension {
    Dimension::multi(
        "use_case_category",
        vec![
            label(
                "Infrastructure",
                with(
                    keywords(&["infrastructure", "iac", "provisioning"]),
                    vec![flag(Flag::HasTerraform), flag(Flag::HasCloudFormation), flag(Flag::HasCdk)],
                ),
            ),
            label(
                "Serverless",
                with(keywords(&["serverless"]), vec![flag(Flag::MentionsLambda), flag(Flag::HasSam)]),
            ),
            svc("Data & Analytics", &["analytics", "data lake", "etl", "data pipeline", "warehouse"]),
            label(
                "Machine Learning",
                with(keywords(&["machine learning", "ml", "sagemaker", "model"]), vec![flag(Flag::MentionsGenAi)]),
            ),
            svc("Security & Compliance", &["security", "compliance", "governance", "audit"]),
            svc("Monitoring & Observability", &["monitoring", "observability", "cloudwatch", "logging", "tracing"]),
            label(
                "CI/CD",
                with(keywords(&["ci cd", "cicd", "pipeline", "codepipeline"]), vec![flag(Flag::HasCi).weight(0.15)]),
            ),
            label(
                "Containers",
                with(keywords(&["container", "containers", "ecs", "eks"]), vec![flag(Flag::HasDockerfile), flag(Flag::HasKubernetes)]),
            ),
            svc("Migration", &["migration", "migrate", "modernization"]),
            svc("Networking", &["networking", "vpc", "transit gateway", "dns"]),
            svc("IoT", &["iot", "greengrass", "edge"]),
            svc("Media", &["media", "video", "streaming", "transcode"]),
        ],
    )
}

fn integration_complexity() -> Dimension {
    Dimension::single(
        "integration_complexity",
        vec![
            label(
                "High",
                with(
                    keywords(&["multi account", "enterprise", "microservices", "hybrid"]),
                    vec![flag(Flag::HasKubernetes)],
                ),
            ),
            label(
                "Medium",
                with(
                    keywords(&["integration", "api", "sdk"]),
                    vec![flag(Flag::HasTerraform).weight(0.2), flag(Flag::HasCdk).weight(0.2)],
                ),
            ),
            svc("Low", &["standalone", "simple", "single", "one click", "quickstart", "script"]),
        ],
    )
}

fn maintenance_level() -> Dimension {
    Dimension::single(
        "maintenance_level",
        vec![
            label(
                "High",
                with(keywords(&["cluster", "self hosted", "self managed"]), vec![flag(Flag::HasKubernetes)]),
            ),
            label(
                "Medium",
                with(keywords(&["ec2", "container", "containers"]), vec![flag(Flag::HasDockerfile)]),
            ),
            label(
                "Low",
                with(keywords(&["serverless", "managed", "fully managed"]), vec![flag(Flag::MentionsLambda)]),
            ),
        ],
    )
}

fn scalability() -> Dimension {
    Dimension::single(
        "scalability",
        vec![
            label(
                "High",
                with(
                    keywords(&["serverless", "auto scaling", "autoscaling", "distributed", "dynamodb", "scalable"]),
                    vec![flag(Flag::MentionsLambda), flag(Flag::HasKubernetes)],
                ),
            ),
            label(
                "Medium",
                with(keywords(&["ecs", "fargate", "containers"]), vec![flag(Flag::HasDockerfile)]),
            ),
            svc("Low", &["single instance", "local", "desktop", "prototype"]),
        ],
    )
}

fn freshness() -> Dimension {
    Dimension {
        name: "freshness",
        kind: DimensionKind::Freshness(FreshnessDimension {
            breakpoints: vec![(89, "Active"), (365, "Maintained"), (730, "Aging")],
            beyond: "Dormant",
        }),
    }
}

fn genai_agentic() -> Dimension {
    Dimension::single(
        "genai_agentic",
        vec![
            label(
                "Agentic",
                with(
                    keywords(&["agent", "agents", "agentic", "multi agent", "autonomous"]),
                    vec![name("agent"), name("agents")],
                ),
            ),
            label(
                "Generative AI",
                with(
                    keywords(&["llm", "genai", "generative ai", "bedrock", "anthropic", "openai", "langchain", "chatbot", "rag"]),
                    vec![flag(Flag::MentionsGenAi)],
                ),
            ),
        ],
    )
}

fn industry_vertical() -> Dimension {
    Dimension::multi(
        "industry_vertical",
        vec![
            svc("Financial Services", &["bank", "banking", "fintech", "payments", "trading", "insurance"]),
            svc("Healthcare & Life Sciences", &["health", "healthcare", "medical", "genomics", "clinical", "hipaa"]),
            svc("Retail & E-commerce", &["retail", "ecommerce", "e commerce", "shopping cart"]),
            svc("Media & Entertainment", &["media", "video", "game", "gaming", "broadcast"]),
            svc("Manufacturing & Industrial", &["manufacturing", "industrial", "factory", "iot"]),
            svc("Public Sector", &["government", "public sector", "education"]),
            svc("Telecommunications", &["telecom", "telco", "5g"]),
        ],
    )
}
